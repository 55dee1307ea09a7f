//! Server-Sent Events (SSE) infrastructure for the hub.
//!
//! This crate owns the per-connection state the subscribe endpoint builds
//! on: the subscriber lifecycle, access checks, frame construction, and the
//! process-wide registry used for shutdown fan-out.
//!
//! # Architecture
//!
//! - **One subscriber per request**: every `GET /.well-known/mercure`
//!   creates a [`Subscriber`] that lives exactly as long as the response
//!   stream.
//! - **Explicit lifecycle**: `Opening → Active → Closing → Closed`. A
//!   subscriber only receives updates while `Active`; closing is idempotent
//!   and cancels the connection's work.
//! - **Access checks on dispatch**: [`Subscriber::can_access`] combines the
//!   subscription selectors with the private-update authorization rule, so
//!   the fan-out path decides per update and per subscriber.
//! - **Frames via axum**: updates are rendered with
//!   [`axum::response::sse::Event`]; heartbeats are axum keep-alive comment
//!   frames armed by the subscribe handler.
//!
//! # Modules
//!
//! - `subscriber`: Subscriber state machine and its Subscriptions
//! - `frame`: SSE frame construction from updates
//! - `registry`: process-wide subscriber registry for shutdown

pub mod frame;
pub mod registry;
pub mod subscriber;

pub use registry::SubscriberRegistry;
pub use subscriber::{Subscriber, SubscriberState, Subscription};
