use std::net::SocketAddrV4;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hickory_proto::op::Query;
use hickory_proto::rr::RecordType;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RepositoryError;

/// Resource-record types a persisted query distinguishes. Anything else is
/// recorded as `None` with the record flagged invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    None,
    A,
    #[serde(rename = "NS")]
    Ns,
    #[serde(rename = "CNAME")]
    Cname,
    #[serde(rename = "SOA")]
    Soa,
    #[serde(rename = "PTR")]
    Ptr,
    #[serde(rename = "MX")]
    Mx,
    #[serde(rename = "TXT")]
    Txt,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "SRV")]
    Srv,
    #[serde(rename = "OPT")]
    Opt,
    #[serde(rename = "DNSKEY")]
    Dnskey,
    #[serde(rename = "SPF")]
    Spf,
}

impl QueryType {
    pub fn from_record_type(rt: RecordType) -> Option<Self> {
        match rt {
            RecordType::ZERO => Some(Self::None),
            RecordType::A => Some(Self::A),
            RecordType::NS => Some(Self::Ns),
            RecordType::CNAME => Some(Self::Cname),
            RecordType::SOA => Some(Self::Soa),
            RecordType::PTR => Some(Self::Ptr),
            RecordType::MX => Some(Self::Mx),
            RecordType::TXT => Some(Self::Txt),
            RecordType::AAAA => Some(Self::Aaaa),
            RecordType::SRV => Some(Self::Srv),
            RecordType::OPT => Some(Self::Opt),
            RecordType::DNSKEY => Some(Self::Dnskey),
            // SPF (99) has no dedicated variant on the wire side.
            RecordType::Unknown(99) => Some(Self::Spf),
            _ => None,
        }
    }
}

/// One persisted row per query seen by the engine. Identity is the UUID;
/// the wire transaction id is kept for correlation lookups but collides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecord {
    pub id: u16,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub originator: String,
    pub originator_type: u8,
    pub domain: String,
    pub root_domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    pub responded: bool,
    pub blocked: bool,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl QueryRecord {
    /// Builds the row for a freshly seen client query.
    pub fn from_question(id: u16, question: &Query, client: SocketAddrV4) -> Self {
        let (query_type, valid) = match QueryType::from_record_type(question.query_type()) {
            Some(qt) => (qt, true),
            None => (QueryType::None, false),
        };

        let domain = question
            .name()
            .to_lowercase()
            .to_string()
            .trim_end_matches('.')
            .to_string();
        let root_domain = root_domain(&domain);

        Self {
            id,
            uuid: Uuid::new_v4(),
            query_type,
            originator: client.ip().to_string(),
            originator_type: 4,
            domain,
            root_domain,
            response: String::new(),
            responded: false,
            blocked: false,
            valid,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// The blocked variant never waits for an upstream answer.
    pub fn mark_blocked(mut self) -> Self {
        self.responded = true;
        self.blocked = true;
        self
    }
}

/// Last two labels of a domain, or the domain itself when there is no
/// subdomain. `some.deep.example.com` yields `example.com`.
pub fn root_domain(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain.to_string();
    }
    format!("{}.{}", labels[labels.len() - 2], labels[labels.len() - 1])
}

/// Data-layer seam the engine talks to. Implementations are injected at
/// engine construction; errors are non-fatal to packet handling.
#[async_trait]
pub trait QueryRepository: Send + Sync {
    async fn create(&self, record: &QueryRecord) -> Result<(), RepositoryError>;
    /// Looks up the most recent record carrying this transaction id.
    async fn find(&self, id: u16) -> Result<QueryRecord, RepositoryError>;
    async fn find_all(&self) -> Result<Vec<QueryRecord>, RepositoryError>;
    /// Replaces the record with the same UUID.
    async fn update(&self, record: &QueryRecord) -> Result<(), RepositoryError>;
    async fn delete(&self, record: &QueryRecord) -> Result<(), RepositoryError>;
}

/// In-memory repository. UUID is the primary key; a secondary index keeps
/// the latest UUID per transaction id so response reconciliation finds the
/// row that is actually in flight.
pub struct MemoryRepository {
    by_uuid: DashMap<Uuid, QueryRecord, FxBuildHasher>,
    latest_by_id: DashMap<u16, Uuid, FxBuildHasher>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            by_uuid: DashMap::with_hasher(FxBuildHasher::default()),
            latest_by_id: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryRepository for MemoryRepository {
    async fn create(&self, record: &QueryRecord) -> Result<(), RepositoryError> {
        self.by_uuid.insert(record.uuid, record.clone());
        self.latest_by_id.insert(record.id, record.uuid);
        Ok(())
    }

    async fn find(&self, id: u16) -> Result<QueryRecord, RepositoryError> {
        let uuid = self
            .latest_by_id
            .get(&id)
            .map(|entry| *entry.value())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        self.by_uuid
            .get(&uuid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(uuid.to_string()))
    }

    async fn find_all(&self) -> Result<Vec<QueryRecord>, RepositoryError> {
        let mut records: Vec<QueryRecord> = self
            .by_uuid
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn update(&self, record: &QueryRecord) -> Result<(), RepositoryError> {
        match self.by_uuid.get_mut(&record.uuid) {
            Some(mut entry) => {
                *entry.value_mut() = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.uuid.to_string())),
        }
    }

    async fn delete(&self, record: &QueryRecord) -> Result<(), RepositoryError> {
        self.by_uuid
            .remove(&record.uuid)
            .ok_or_else(|| RepositoryError::NotFound(record.uuid.to_string()))?;
        self.latest_by_id
            .remove_if(&record.id, |_, uuid| *uuid == record.uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::Name;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn question(name: &str, rt: RecordType) -> Query {
        Query::query(Name::from_str(name).expect("name"), rt)
    }

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 54321)
    }

    #[test]
    fn root_domain_keeps_last_two_labels() {
        assert_eq!(root_domain("some.deep.example.com"), "example.com");
        assert_eq!(root_domain("example.com"), "example.com");
        assert_eq!(root_domain("localhost"), "localhost");
        assert_eq!(root_domain("example.com."), "example.com");
    }

    #[test]
    fn record_from_question_strips_the_trailing_dot() {
        let record =
            QueryRecord::from_question(0x1234, &question("Ads.Example.COM.", RecordType::A), client());

        assert_eq!(record.id, 0x1234);
        assert_eq!(record.domain, "ads.example.com");
        assert_eq!(record.root_domain, "example.com");
        assert_eq!(record.query_type, QueryType::A);
        assert_eq!(record.originator, "10.0.0.2");
        assert_eq!(record.originator_type, 4);
        assert!(record.valid);
        assert!(!record.blocked);
        assert!(!record.responded);
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn unmapped_record_type_flags_the_record_invalid() {
        let record =
            QueryRecord::from_question(1, &question("example.com.", RecordType::TLSA), client());

        assert_eq!(record.query_type, QueryType::None);
        assert!(!record.valid);
    }

    #[test]
    fn blocked_record_is_responded_and_blocked() {
        let record = QueryRecord::from_question(1, &question("ads.example.com.", RecordType::A), client())
            .mark_blocked();

        assert!(record.blocked);
        assert!(record.responded);
    }

    #[test]
    fn serialized_shape_keeps_the_original_field_names() {
        let record = QueryRecord::from_question(7, &question("a.example.com.", RecordType::A), client());
        let json = serde_json::to_value(&record).expect("serialize");

        assert_eq!(json["type"], "A");
        assert_eq!(json["originatorType"], 4);
        assert_eq!(json["rootDomain"], "example.com");
        assert!(json.get("createdAt").is_some());
        // Empty response and null updatedAt stay off the wire.
        assert!(json.get("response").is_none());
        assert!(json.get("updatedAt").is_none());
    }

    #[tokio::test]
    async fn create_then_find_by_transaction_id() {
        let repo = MemoryRepository::new();
        let record = QueryRecord::from_question(42, &question("example.org.", RecordType::A), client());

        repo.create(&record).await.expect("create");
        let found = repo.find(42).await.expect("find");

        assert_eq!(found.uuid, record.uuid);
        assert_eq!(found.domain, "example.org");
    }

    #[tokio::test]
    async fn find_missing_id_reports_not_found() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.find(0xDEAD).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn colliding_ids_keep_both_records_and_find_returns_the_latest() {
        let repo = MemoryRepository::new();
        let first = QueryRecord::from_question(1, &question("a.example.com.", RecordType::A), client());
        let second = QueryRecord::from_question(1, &question("b.example.com.", RecordType::A), client());

        repo.create(&first).await.expect("create");
        repo.create(&second).await.expect("create");

        assert_eq!(repo.find(1).await.expect("find").uuid, second.uuid);
        assert_eq!(repo.find_all().await.expect("find_all").len(), 2);
    }

    #[tokio::test]
    async fn update_replaces_by_uuid() {
        let repo = MemoryRepository::new();
        let mut record = QueryRecord::from_question(9, &question("example.net.", RecordType::A), client());
        repo.create(&record).await.expect("create");

        record.responded = true;
        record.response = "example.net".to_string();
        record.updated_at = Some(Utc::now());
        repo.update(&record).await.expect("update");

        let found = repo.find(9).await.expect("find");
        assert!(found.responded);
        assert_eq!(found.response, "example.net");
        assert!(found.updated_at.is_some());
    }

    #[tokio::test]
    async fn update_of_unknown_uuid_reports_not_found() {
        let repo = MemoryRepository::new();
        let record = QueryRecord::from_question(9, &question("example.net.", RecordType::A), client());
        assert!(matches!(
            repo.update(&record).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_record_and_index() {
        let repo = MemoryRepository::new();
        let record = QueryRecord::from_question(5, &question("example.com.", RecordType::A), client());
        repo.create(&record).await.expect("create");

        repo.delete(&record).await.expect("delete");

        assert!(repo.find(5).await.is_err());
        assert!(repo.find_all().await.expect("find_all").is_empty());
    }
}
