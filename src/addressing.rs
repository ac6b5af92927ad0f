//! Queue naming conventions.
//!
//! Any proxy can reach any running server from its id alone, without a
//! discovery service, so these formats are part of the wire contract.

use uuid::Uuid;

use crate::Address;

/// Inbound queue of the server(s) registered under `server_id`.
pub fn server_address(server_id: &str) -> Address {
    Address::from(format!("server_{server_id}_queue"))
}

/// Private reply queue for one proxy, unique per call of this function.
///
/// `user` is the broker user the proxy connects as; it only makes the queue
/// easier to attribute in the broker's management UI.
pub fn reply_address(user: &str) -> Address {
    reply_address_with_token(user, &Uuid::new_v4().simple().to_string())
}

pub(crate) fn reply_address_with_token(user: &str, token: &str) -> Address {
    Address::from(format!("client_{user}_queue_{token}"))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_server_address_is_deterministic() {
        // ---
        assert_eq!(server_address("fooserver").as_str(), "server_fooserver_queue");
        assert_eq!(server_address("fooserver"), server_address("fooserver"));
    }

    #[test]
    fn test_reply_addresses_are_private() {
        // ---
        let a = reply_address("guest");
        let b = reply_address("guest");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client_guest_queue_"));
    }

    #[test]
    fn test_reply_address_format() {
        // ---
        let addr = reply_address_with_token("bob", "abc123");
        assert_eq!(addr.as_str(), "client_bob_queue_abc123");
    }
}
