//! Pluggable liveness probes for pooled connections.

use crate::node::{self, Connection};

use async_trait::async_trait;
use std::sync::Arc;

/// Decides whether an idle connection may still be handed out.
///
/// Validators run while a connection sits in the pool: on each
/// replenishment sweep, and (for the lazy pool) during idle eviction and
/// when borrowing. Every call is bounded by
/// [crate::policy::Policy::validation_timeout].
#[async_trait]
pub trait Validator<Conn: Connection>: Send + Sync {
    async fn validate(&self, conn: &mut Conn) -> Result<(), node::Error>;
}

pub type SharedValidator<Conn> = Arc<dyn Validator<Conn>>;

/// The default validator: trusts [Connection::is_open].
#[derive(Clone, Copy, Debug, Default)]
pub struct LivenessValidator;

#[async_trait]
impl<Conn: Connection> Validator<Conn> for LivenessValidator {
    async fn validate(&self, conn: &mut Conn) -> Result<(), node::Error> {
        if conn.is_open() {
            Ok(())
        } else {
            Err(node::Error::Io(std::io::ErrorKind::NotConnected.into()))
        }
    }
}
