//! Agent-facing view of the pub/sub session.
//!
//! Couples the outbound [`MqttPort`] with the [`Router`], so a
//! subscription is only ever live on the broker while a handler for it is
//! registered locally.

use core::time::Duration;
use std::sync::Arc;

use log::{debug, warn};

use super::router::{InboundHandler, Router};
use crate::app::ports::{MqttPort, QoS};
use crate::error::{Error, ProtocolError};

pub struct Session {
    mqtt: Arc<dyn MqttPort>,
    router: Arc<Router>,
    thing_name: String,
    ack_timeout: Duration,
}

impl Session {
    pub fn new(
        mqtt: Arc<dyn MqttPort>,
        router: Arc<Router>,
        thing_name: &str,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            mqtt,
            router,
            thing_name: thing_name.to_owned(),
            ack_timeout,
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Register `handler` for every filter, then subscribe and wait for the
    /// broker's ack.  If either step fails, only the entries this call
    /// made are rolled back; other handlers on the same filters stay.
    pub fn subscribe(&self, filters: &[&str], handler: &Arc<dyn InboundHandler>) -> Result<(), Error> {
        let mut added: Vec<&str> = Vec::with_capacity(filters.len());
        for &filter in filters {
            match self.router.register(filter, Arc::clone(handler)) {
                Ok(true) => added.push(filter),
                Ok(false) => {}
                Err(e) => {
                    self.roll_back(&added, handler);
                    return Err(e.into());
                }
            }
        }

        let acked = self
            .mqtt
            .subscribe(filters, QoS::AtLeastOnce)
            .and_then(|id| self.mqtt.wait_for_ack(id, self.ack_timeout));
        if let Err(e) = acked {
            warn!("Session: subscribe {:?} failed: {}", filters, e);
            self.roll_back(&added, handler);
            return Err(e.into());
        }
        debug!("Session: subscribed {:?}", filters);
        Ok(())
    }

    fn roll_back(&self, added: &[&str], handler: &Arc<dyn InboundHandler>) {
        for filter in added {
            self.router.remove_handler(filter, handler);
        }
    }

    /// Drop local handlers, then unsubscribe on the broker.
    pub fn unsubscribe(&self, filters: &[&str]) -> Result<(), Error> {
        for filter in filters {
            self.router.remove(filter);
        }
        let id = self.mqtt.unsubscribe(filters)?;
        self.mqtt.wait_for_ack(id, self.ack_timeout)?;
        debug!("Session: unsubscribed {:?}", filters);
        Ok(())
    }

    /// Re-establish every registered subscription on a fresh broker
    /// session.  Local handlers are left as they are.
    pub fn resubscribe_all(&self) -> Result<(), Error> {
        let filters = self.router.filters();
        if filters.is_empty() {
            return Ok(());
        }
        let refs: Vec<&str> = filters.iter().map(String::as_str).collect();
        let id = self.mqtt.subscribe(&refs, QoS::AtLeastOnce)?;
        self.mqtt.wait_for_ack(id, self.ack_timeout)?;
        debug!("Session: restored {} subscriptions", refs.len());
        Ok(())
    }

    /// Publish; at-least-once publishes wait for the broker's ack.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), ProtocolError> {
        let id = self.mqtt.publish(topic, payload, qos)?;
        if qos == QoS::AtLeastOnce {
            self.mqtt.wait_for_ack(id, self.ack_timeout)?;
        }
        Ok(())
    }
}
