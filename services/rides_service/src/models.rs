use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Status vocabularies. Stored as-is in the database; every transition site
// goes through these constants rather than string literals.
pub mod ride_status {
    pub const SCHEDULED: &str = "scheduled";
    pub const ONGOING: &str = "ongoing";
    pub const COMPLETED: &str = "completed";
    pub const CANCELLED: &str = "cancelled";

    pub fn is_terminal(s: &str) -> bool {
        matches!(s, COMPLETED | CANCELLED)
    }
}

pub mod booking_status {
    pub const PENDING: &str = "pending";
    pub const CONFIRMED: &str = "confirmed";
    pub const CANCELLED: &str = "cancelled";
    pub const COMPLETED: &str = "completed";

    pub fn is_terminal(s: &str) -> bool {
        matches!(s, CANCELLED | COMPLETED)
    }
}

pub mod payment_status {
    pub const PENDING: &str = "pending";
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
    pub const REFUNDED: &str = "refunded";
}

pub mod payment_kind {
    pub const BOOKING: &str = "booking";
    pub const DRIVER_PAYOUT: &str = "driver_payout";
}

pub mod payout_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

pub mod user_role {
    pub const DRIVER: &str = "driver";
    pub const PASSENGER: &str = "passenger";
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub env: String,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserReq {
    pub name: String,
    pub phone: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    user_role::PASSENGER.to_string()
}

#[derive(Debug, Serialize, Clone)]
pub struct UserOut {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: String,
    pub driver_approved: bool,
    pub driver_rating: f64,
    pub total_rides: i32,
    pub balance_cents: i64,
}

#[derive(Debug, Serialize, Clone)]
pub struct DriverSummaryOut {
    pub id: String,
    pub name: String,
    pub driver_rating: f64,
    pub total_rides: i32,
}

#[derive(Debug, Deserialize)]
pub struct RideIn {
    pub source: String,
    pub destination: String,
    pub ride_date: String, // YYYY-MM-DD
    pub ride_time: String, // HH:MM
    #[serde(default = "default_seats_total")]
    pub seats_total: i32,
    #[serde(default = "default_base_fare_cents")]
    pub base_fare_cents: i64,
    #[serde(default = "default_rate_per_km_cents")]
    pub rate_per_km_cents: i64,
}

fn default_seats_total() -> i32 {
    3
}

fn default_base_fare_cents() -> i64 {
    5_000
}

fn default_rate_per_km_cents() -> i64 {
    500
}

/// Typed partial update for a scheduled ride; absent fields are untouched.
#[derive(Debug, Deserialize, Default)]
pub struct RideUpdateIn {
    pub ride_date: Option<String>,
    pub ride_time: Option<String>,
    pub seats_total: Option<i32>,
}

#[derive(Debug, Serialize, Clone)]
pub struct RideOut {
    pub id: String,
    pub driver_id: String,
    pub source: String,
    pub destination: String,
    pub ride_date: String,
    pub ride_time: String,
    pub seats_total: i32,
    pub seats_available: i32,
    pub base_fare_cents: i64,
    pub rate_per_km_cents: i64,
    pub total_distance_km: f64,
    pub estimated_fare_cents: i64,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RideSearchOut {
    pub ride: RideOut,
    pub driver: DriverSummaryOut,
}

#[derive(Debug, Deserialize)]
pub struct BookReq {
    #[serde(default = "default_book_seats")]
    pub seats: i32,
    pub pickup: Option<String>,
    pub dropoff: Option<String>,
}

fn default_book_seats() -> i32 {
    1
}

#[derive(Debug, Serialize, Clone)]
pub struct BookingOut {
    pub id: String,
    pub ride_id: String,
    pub passenger_id: String,
    pub pickup: String,
    pub dropoff: String,
    pub distance_km: f64,
    pub fare_cents: i64,
    pub seats: i32,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct BookingCancelOut {
    pub booking: BookingOut,
    pub refunded_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct OrderReq {
    pub booking_id: String,
    // Deliberately no amount field: the booking's stored fare is the only
    // accepted amount, so a tampered client amount has nothing to override.
}

#[derive(Debug, Serialize)]
pub struct OrderOut {
    pub order_id: String,
    pub booking_id: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyReq {
    pub order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyOut {
    pub booking_id: String,
    pub payment_status: String,
    pub booking_status: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct PaymentOut {
    pub id: String,
    pub booking_id: String,
    pub passenger_id: String,
    pub driver_id: String,
    pub order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub kind: String,
    pub driver_payment_status: String,
    pub driver_paid_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PayoutReq {
    pub booking_id: String,
}

#[derive(Debug, Serialize)]
pub struct PayoutOut {
    pub booking_id: String,
    pub amount_cents: i64,
    pub balance_cents: i64,
    pub driver_paid_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WalletOut {
    pub driver_id: String,
    pub balance_cents: i64,
    pub completed_payout_cents: i64,
    pub pending_payout_cents: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewIn {
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewOut {
    pub id: String,
    pub booking_id: String,
    pub reviewer_id: String,
    pub driver_id: String,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReviewedOut {
    pub booking_id: String,
    pub reviewed: bool,
}

#[derive(Debug, Serialize)]
pub struct RatingOut {
    pub driver_id: String,
    pub average_rating: f64,
    pub review_count: i64,
}
