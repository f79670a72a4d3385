//! Domain types shared by the storage layer, the notifier and the HTTP app.
//!
//! Nothing in here performs I/O.

pub mod cart;
pub mod status;
pub mod types;

pub use cart::{Cart, CartError, CartLine};
pub use status::{OrderStatus, PaymentStatus, StatusTransitionError, UnknownPaymentStatus};
pub use types::{Category, MenuData, MenuItem, Order, OrderLine, StaffMember, UserDetails};
