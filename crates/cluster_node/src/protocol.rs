//! Node-to-node heartbeat messages.
//!
//! A game or gate node pings the master as soon as the uplink is up. The
//! master answers every `Ping` with a `Pong` carrying the same ticket, and the
//! pinging side resolves that ticket on its own session.

use cluster_net::{Processor, RegistryError, SessionRef, Ticket, TicketPayload};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const PING: &str = "Ping";
pub const PONG: &str = "Pong";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub ticket: Ticket,
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub ticket: Ticket,
    pub sent_at_ms: u64,
}

/// Registers the heartbeat messages and their handlers.
pub fn register(processor: &Processor) -> Result<(), RegistryError> {
    processor.register::<Ping>(PING)?;
    processor.register::<Pong>(PONG)?;

    processor.set_handler::<Ping, _>(PING, |ping, session| {
        debug!("ping from {}", session.remote_addr());
        session.write_message(&Pong {
            ticket: ping.ticket,
            sent_at_ms: ping.sent_at_ms,
        });
    })?;

    processor.set_handler::<Pong, _>(PONG, |pong, session| {
        let payload: TicketPayload = Arc::new(pong.clone());
        if let Err(e) = session.exec_ticket(pong.ticket, payload) {
            warn!("unmatched pong from {}: {}", session.remote_addr(), e);
        }
    })?;

    Ok(())
}

/// Sends a `Ping` whose `Pong` logs the measured round trip.
pub fn send_ping(session: &SessionRef) {
    let peer = session.remote_addr();
    let ticket = session.get_ticket(Box::new(move |payload: TicketPayload| {
        if let Some(pong) = payload.downcast_ref::<Pong>() {
            let rtt = now_ms().saturating_sub(pong.sent_at_ms);
            info!("💓 Master {} answered in {}ms", peer, rtt);
        }
    }));

    match ticket {
        Some(ticket) => session.write_message(&Ping {
            ticket,
            sent_at_ms: now_ms(),
        }),
        None => warn!("no free ticket to ping {}", peer),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_net::{Agent, Conn, MemoryConn, Session};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_ping_resolves_on_pong() {
        let master = Arc::new(Processor::new());
        register(&master).unwrap();
        let node = Arc::new(Processor::new());
        register(&node).unwrap();

        let (master_conn, node_conn) = MemoryConn::pair(16, 4096);
        let master_conn: Arc<dyn Conn> = master_conn;
        let node_conn: Arc<dyn Conn> = node_conn;
        let master_agent = Arc::new(Agent::new(master_conn, Some(master)));
        let node_agent = Arc::new(Agent::new(node_conn, Some(node)));
        tokio::spawn(master_agent.clone().serve());
        tokio::spawn(node_agent.clone().serve());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session: SessionRef = node_agent.clone();
        let ticket = session
            .get_ticket(Box::new(move |payload: TicketPayload| {
                let _ = tx.send(payload.downcast_ref::<Pong>().cloned());
            }))
            .unwrap();
        session.write_message(&Ping {
            ticket,
            sent_at_ms: 42,
        });

        let pong = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pong, Pong { ticket, sent_at_ms: 42 });
        assert!(node_agent.results().is_empty());

        send_ping(&session);
        node_agent.close();
        master_agent.close();
    }

    #[test]
    fn test_register_twice_fails() {
        let processor = Processor::new();
        register(&processor).unwrap();
        assert!(register(&processor).is_err());
    }
}
