//! Domain records for the reservation service.
//!
//! These are the typed shapes crossing the HTTP boundary and the rows
//! persisted per instance. Validation happens at the edge: request bodies
//! deserialize into the `New*` records and anything malformed is rejected
//! before it reaches the queue or the database.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A catalogued book. `available_copies` only moves through reservation
/// execution; `0 <= available_copies <= total_copies` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub category: String,
    pub total_copies: u32,
    pub available_copies: u32,
}

/// Body for `POST /books`. A new book starts fully available.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBook {
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub category: String,
    pub total_copies: u32,
}

/// Membership tiers recognized by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipType {
    Student,
    Faculty,
    Staff,
}

impl MembershipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipType::Student => "student",
            MembershipType::Faculty => "faculty",
            MembershipType::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(MembershipType::Student),
            "faculty" => Some(MembershipType::Faculty),
            "staff" => Some(MembershipType::Staff),
            _ => None,
        }
    }
}

/// A registered user. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub membership_type: MembershipType,
}

/// Body for `POST /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub membership_type: MembershipType,
}

/// Reservation lifecycle. A reservation is created `Pending` and
/// transitions exactly once to `Confirmed` or `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReservationStatus::Pending),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "rejected" => Some(ReservationStatus::Rejected),
            _ => None,
        }
    }
}

/// A persisted reservation row. `reason` is populated only on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: i64,
    pub user_id: String,
    pub isbn: String,
    pub status: ReservationStatus,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub reason: Option<String>,
}

/// Body for `POST /reservations`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReservation {
    pub user_id: String,
    pub isbn: String,
}

/// In-memory queue record, alive only between enqueue and batch pickup.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub reservation_id: i64,
    pub user_id: String,
    pub isbn: String,
    pub enqueued_at: Instant,
    /// Processing attempts so far; bumped on each transient failure.
    pub attempts: u32,
}

impl QueueEntry {
    pub fn new(reservation_id: i64, user_id: String, isbn: String) -> Self {
        Self {
            reservation_id,
            user_id,
            isbn,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}
