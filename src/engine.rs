use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::Utc;
use hickory_proto::op::{Message, MessageType};
use tracing::{debug, error, info, warn};

use crate::adblock::{MatchOptions, RuleSet};
use crate::blocklist::Blocklist;
use crate::cache::CorrelationCache;
use crate::codec;
use crate::error::HandleError;
use crate::query_log::{QueryRecord, QueryRepository};
use crate::transport::{Inbound, UdpTransport};

/// Orchestrates the whole datagram path: classify, decide, synthesize or
/// forward, reconcile. Owns the transport; holds shared handles to the
/// blocking data and the repository, none of which point back at it.
pub struct Engine {
    transport: Arc<UdpTransport>,
    upstream: SocketAddrV4,
    blocklist: Arc<Blocklist>,
    rules: Arc<ArcSwap<RuleSet>>,
    cache: Arc<CorrelationCache>,
    repository: Arc<dyn QueryRepository>,
    match_options: MatchOptions,
}

impl Engine {
    pub fn new(
        transport: Arc<UdpTransport>,
        upstream: SocketAddrV4,
        blocklist: Arc<Blocklist>,
        rules: Arc<ArcSwap<RuleSet>>,
        cache: Arc<CorrelationCache>,
        repository: Arc<dyn QueryRepository>,
        match_options: MatchOptions,
    ) -> Self {
        Self {
            transport,
            upstream,
            blocklist,
            rules,
            cache,
            repository,
            match_options,
        }
    }

    /// Receive loop. Returns only when the transport reports closure; every
    /// per-datagram failure is logged and the loop keeps serving.
    pub async fn run(&self) {
        loop {
            match self.transport.recv().await {
                Ok(Inbound::Closed) => {
                    info!("dns receive loop closed");
                    return;
                }
                Ok(Inbound::Datagram { bytes, peer }) => {
                    if let Err(err) = self.dispatch(bytes, peer).await {
                        log_handle_error(&err);
                    }
                }
                Err(err) => {
                    error!(error = %err, "could not read from udp socket");
                }
            }
        }
    }

    async fn dispatch(&self, packet: Bytes, peer: SocketAddr) -> Result<(), HandleError> {
        let client = match peer {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err(HandleError::CannotHandle(peer)),
        };

        let msg = codec::parse(&packet).map_err(|source| HandleError::Codec { peer, source })?;

        if msg.message_type() == MessageType::Response {
            self.handle_response(&packet, msg).await
        } else {
            self.handle_query(&packet, msg, client).await
        }
    }

    /// Client-query path: answer blocked names with NXDOMAIN on the spot,
    /// forward everything else and remember who asked.
    async fn handle_query(
        &self,
        packet: &[u8],
        mut msg: Message,
        client: SocketAddrV4,
    ) -> Result<(), HandleError> {
        let Some(question) = msg.queries().first() else {
            debug!(id = msg.id(), %client, "query without question section dropped");
            return Ok(());
        };
        let qname = question.name().to_lowercase().to_string();
        let record = QueryRecord::from_question(msg.id(), question, client);

        let (blocked, rule) = self.decide_block(&qname);
        if blocked {
            let dest = SocketAddr::V4(client);
            codec::into_blocked_reply(&mut msg);
            let reply = codec::emit(&msg)
                .map_err(|source| HandleError::Codec { peer: dest, source })?;
            self.transport
                .send_to(&reply, dest)
                .await
                .map_err(|source| HandleError::Send { dest, source })?;
            info!(qname = %qname, id = msg.id(), client = %client, rule = ?rule, "blocked");

            let record = record.mark_blocked();
            if let Err(err) = self.repository.create(&record).await {
                warn!(error = %err, uuid = %record.uuid, "could not persist blocked query");
            }
            return Ok(());
        }

        // Forward the client's bytes untouched; the upstream sees exactly
        // what the client sent.
        let upstream = SocketAddr::V4(self.upstream);
        self.transport
            .send_to(packet, upstream)
            .await
            .map_err(|source| HandleError::Send { dest: upstream, source })?;
        self.cache.put(msg.id(), client);

        if let Err(err) = self.repository.create(&record).await {
            warn!(error = %err, uuid = %record.uuid, "could not persist forwarded query");
        }
        debug!(qname = %qname, id = msg.id(), upstream = %upstream, "forwarded");
        Ok(())
    }

    /// Upstream-response path: look up who asked, relay the answer bytes
    /// verbatim, then retire the correlation entry and the record.
    async fn handle_response(&self, packet: &[u8], msg: Message) -> Result<(), HandleError> {
        let id = msg.id();
        let Some(client) = self.cache.get(id) else {
            return Err(HandleError::CorrelationMiss(id));
        };

        let dest = SocketAddr::V4(client);
        // On send failure the entry stays put and ages out via the TTL.
        self.transport
            .send_to(packet, dest)
            .await
            .map_err(|source| HandleError::Send { dest, source })?;
        self.cache.remove(id);
        debug!(id, client = %client, "response reconciled");

        match self.repository.find(id).await {
            Ok(mut record) => {
                record.responded = true;
                record.updated_at = Some(Utc::now());
                if let Some(answer) = msg.answers().first() {
                    record.response = answer.name().to_string().trim_end_matches('.').to_string();
                }
                if let Err(err) = self.repository.update(&record).await {
                    warn!(error = %err, id, "could not update query record");
                }
            }
            Err(err) => {
                warn!(error = %err, id, "could not load query record for response");
            }
        }
        Ok(())
    }

    /// Exact list first, then the rule database. A rule-matcher failure
    /// counts as not blocked so a slow or broken rule set never breaks
    /// resolution.
    fn decide_block(&self, qname: &str) -> (bool, Option<usize>) {
        if self.blocklist.contains(qname) {
            return (true, None);
        }

        let rules = self.rules.load();
        match rules.should_block(qname, &self.match_options) {
            Ok(Some(index)) => (true, Some(index)),
            Ok(None) => (false, None),
            Err(err) => {
                warn!(qname = %qname, error = %err, "rule matcher failed, treating as not blocked");
                (false, None)
            }
        }
    }
}

fn log_handle_error(err: &HandleError) {
    match err {
        HandleError::CorrelationMiss(id) => debug!(id, "dangling response dropped"),
        HandleError::CannotHandle(peer) => warn!(%peer, "cannot handle non-IPv4 originator"),
        HandleError::Codec { peer, source } => {
            warn!(%peer, error = %source, "malformed datagram dropped")
        }
        HandleError::Send { dest, source } => error!(%dest, error = %source, "datagram send failed"),
    }
}
