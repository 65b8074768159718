// SPDX-License-Identifier: MPL-2.0

pub mod client_session;
pub mod subscriptions;

pub use client_session::{ClientSession, ConnectionState, SessionResumption};
pub use subscriptions::{topic_matches_filter, SubscriptionTable};
