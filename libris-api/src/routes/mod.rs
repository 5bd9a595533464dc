//! HTTP route handlers for one API instance.
//!
//! - `books`: catalog reads (cache-backed) and admin writes
//! - `users`: registration and lookup
//! - `reservations`: the async write path (validate → enqueue → 202)
//! - `monitor`: `/sla`, `/metrics`, `/health`, and the root banner

pub mod books;
pub mod monitor;
pub mod reservations;
pub mod users;

pub use books::{create_book, get_book, list_books};
pub use monitor::{health, metrics, root, sla};
pub use reservations::{create_reservation, my_reservations};
pub use users::{create_user, get_user};
