//! Storage-node registration and heartbeat runtime.
//!
//! A node registers once at startup and then reports liveness and capacity
//! on a fixed interval. Heartbeats ride the pooled overseer connection, so
//! a broken link heals on the next tick. A FAIL reply means the registry no
//! longer recognizes this node (restarted overseer, aged-out record) and
//! triggers a re-registration.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::common::error::{Error, Result};
use crate::common::packet::PacketType;
use crate::common::payload::{decode_payload, encode_payload, RegisterResponse};
use crate::net::client::response_to_result;
use crate::storage::server::StorageState;

pub(crate) async fn register_with_overseer(state: &Arc<StorageState>) -> Result<()> {
    let client = state.pool.get(&state.config.overseer_addr).await?;
    let report = state.node_report().await;
    let reply = client
        .request(PacketType::StorageRegister, encode_payload(&report)?)
        .await?;
    let reply = response_to_result(reply)?;
    let response: RegisterResponse = decode_payload(&reply.payload)?;
    if !response.accepted {
        return Err(Error::Remote(response.message));
    }
    info!(
        "node {} registered with overseer at {}",
        state.node_id, state.config.overseer_addr
    );
    Ok(())
}

pub(crate) async fn heartbeat_loop(state: Arc<StorageState>) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and we just registered
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match send_heartbeat(&state).await {
            Ok(()) => debug!("heartbeat acknowledged"),
            Err(e @ Error::Remote(_)) => {
                warn!("heartbeat rejected ({}), re-registering", e);
                if let Err(e) = register_with_overseer(&state).await {
                    warn!("re-registration failed: {}", e);
                }
            }
            Err(e) => warn!("heartbeat failed: {}", e),
        }
    }
}

async fn send_heartbeat(state: &Arc<StorageState>) -> Result<()> {
    let client = state.pool.get(&state.config.overseer_addr).await?;
    let report = state.node_report().await;
    let reply = client
        .request(PacketType::HeartBeat, encode_payload(&report)?)
        .await?;
    response_to_result(reply).map(|_| ())
}
