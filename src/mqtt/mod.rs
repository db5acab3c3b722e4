//! Pub/sub plumbing shared by both agents.
//!
//! | Module       | Role                                              |
//! |--------------|---------------------------------------------------|
//! | `topic`      | topic builders and wildcard matching              |
//! | `router`     | filter → handler table for inbound publishes      |
//! | `session`    | subscribe/unsubscribe/publish with ack waits      |
//! | `backoff`    | jittered exponential retry delays                 |
//! | `connection` | transport lifecycle and credential swap           |

pub mod backoff;
pub mod connection;
pub mod router;
pub mod session;
pub mod topic;
