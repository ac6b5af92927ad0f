//! Domain layer public interface.
//!
//! Transport-independent abstractions. All domain consumers must import
//! symbols via this module, not by referencing individual files directly.

mod transport;

pub use transport::{
    //
    Acker,
    Address,
    Delivery,
    Envelope,
    SubscribeOptions,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};
