//! Cluster-aware client: a shared slot table refreshed from `CLUSTER SLOTS`,
//! slot computation from a key or hash tag, replica-aware read routing, and
//! `MOVED`/`ASK` redirect handling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use coro_core::error::{CoreError, ErrorKind};

use crate::client::{Client, ClientParams};
use crate::crc16;
use crate::resp::RedisValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub node_id: Option<String>,
}

impl NodeInfo {
    fn same_node(&self, other: &NodeInfo) -> bool {
        match (&self.node_id, &other.node_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.host == other.host && self.port == other.port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: NodeInfo,
    pub replicas: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct RedisSlotsTable {
    pub ranges: Vec<SlotRange>,
    pub primaries: Vec<NodeInfo>,
    pub all_nodes: Vec<NodeInfo>,
}

impl RedisSlotsTable {
    fn group_for_slot(&self, slot: u16) -> Result<&SlotRange, CoreError> {
        self.ranges
            .iter()
            .find(|r| slot >= r.start && slot <= r.end)
            .ok_or_else(|| CoreError::new(ErrorKind::TaskError, "slot not covered by cluster table"))
    }
}

/// Where a command's slot comes from.
#[derive(Debug, Clone)]
pub enum SlotOpt {
    Literal(u16),
    /// Derive the slot from the command itself; currently rejected, same as
    /// upstream, since the derivation rule depends on per-command argument
    /// layout this client doesn't model.
    AutoSlot,
    /// A negative key index: `-i` means hash `command[i]`.
    KeyIndex(i64),
    /// Any primary at random.
    AnyPrimary,
}

#[derive(Debug, Clone)]
pub struct ExecuteOpt {
    pub slot: SlotOpt,
    pub read_only: bool,
}

impl ExecuteOpt {
    pub fn write(slot: SlotOpt) -> Self {
        Self { slot, read_only: false }
    }

    pub fn read(slot: SlotOpt) -> Self {
        Self { slot, read_only: true }
    }
}

#[derive(Debug)]
enum Redirect {
    Moved { host: String, port: u16 },
    Ask { host: String, port: u16 },
}

fn parse_redirect(msg: &str) -> Option<Redirect> {
    let mut parts = msg.split_whitespace();
    let kind = parts.next()?;
    let _slot = parts.next()?;
    let addr = parts.next()?;
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    match kind {
        "MOVED" => Some(Redirect::Moved { host: host.to_string(), port }),
        "ASK" => Some(Redirect::Ask { host: host.to_string(), port }),
        _ => None,
    }
}

fn parse_slots_table(value: &RedisValue, request_host: &str) -> Result<RedisSlotsTable, CoreError> {
    let entries = value
        .as_array()
        .ok_or_else(|| CoreError::invalid_input("CLUSTER SLOTS reply must be an array"))?;
    let mut ranges = Vec::with_capacity(entries.len());
    let mut all_nodes: Vec<NodeInfo> = Vec::new();
    let mut primaries: Vec<NodeInfo> = Vec::new();

    for entry in entries {
        let fields = entry
            .as_array()
            .ok_or_else(|| CoreError::invalid_input("slot range entry must be an array"))?;
        if fields.len() < 3 {
            return Err(CoreError::invalid_input("slot range entry too short"));
        }
        let start = fields[0]
            .as_integer()
            .ok_or_else(|| CoreError::invalid_input("slot range start must be an integer"))?;
        let end = fields[1]
            .as_integer()
            .ok_or_else(|| CoreError::invalid_input("slot range end must be an integer"))?;
        if start < 0 || end < 0 || start >= crc16::SLOT_COUNT as i64 || end >= crc16::SLOT_COUNT as i64 || start > end {
            return Err(CoreError::invalid_input("slot range out of bounds"));
        }

        let mut nodes = Vec::with_capacity(fields.len() - 2);
        for node_val in &fields[2..] {
            let node_fields = node_val
                .as_array()
                .ok_or_else(|| CoreError::invalid_input("node entry must be an array"))?;
            if node_fields.len() < 2 {
                return Err(CoreError::invalid_input("node entry too short"));
            }
            let host = match &node_fields[0] {
                RedisValue::Null => request_host.to_string(),
                other => other
                    .as_bulk_str()
                    .ok_or_else(|| CoreError::invalid_input("node host must be a string"))?
                    .to_string(),
            };
            let port = node_fields[1]
                .as_integer()
                .ok_or_else(|| CoreError::invalid_input("node port must be an integer"))? as u16;
            let node_id = node_fields.get(2).and_then(|v| v.as_bulk_str()).map(str::to_string);
            nodes.push(NodeInfo { host, port, node_id });
        }

        let primary = nodes.first().cloned().ok_or_else(|| CoreError::invalid_input("slot range has no primary"))?;
        let replicas: Vec<NodeInfo> = nodes.iter().skip(1).filter(|n| n.host != "?").cloned().collect();

        for (i, node) in nodes.iter().enumerate() {
            if node.host == "?" {
                continue;
            }
            if !all_nodes.iter().any(|n| n.same_node(node)) {
                all_nodes.push(node.clone());
            }
            if i == 0 && !primaries.iter().any(|n| n.same_node(node)) {
                primaries.push(node.clone());
            }
        }

        ranges.push(SlotRange {
            start: start as u16,
            end: end as u16,
            primary,
            replicas,
        });
    }

    ranges.sort_by_key(|r| r.start);
    Ok(RedisSlotsTable { ranges, primaries, all_nodes })
}

/// A client that tracks cluster topology and retries requests through
/// `MOVED`/`ASK` redirection.
pub struct ClusterClient {
    base_params: ClientParams,
    seeds: Vec<(String, u16)>,
    table: RwLock<Option<Arc<RedisSlotsTable>>>,
    outdated: AtomicBool,
    refresh_lock: AsyncMutex<()>,
    node_clients: DashMap<(String, u16), Arc<Client>>,
    replica_cursor: AtomicU64,
    retry_max: u32,
    use_replica_reads: bool,
}

impl ClusterClient {
    pub fn new(seeds: Vec<(String, u16)>, base_params: ClientParams, retry_max: u32, use_replica_reads: bool) -> Self {
        Self {
            base_params,
            seeds,
            table: RwLock::new(None),
            outdated: AtomicBool::new(false),
            refresh_lock: AsyncMutex::new(()),
            node_clients: DashMap::new(),
            replica_cursor: AtomicU64::new(0),
            retry_max: retry_max.max(1),
            use_replica_reads,
        }
    }

    fn client_for(&self, host: &str, port: u16) -> Arc<Client> {
        let key = (host.to_string(), port);
        let entry = self.node_clients.entry(key).or_insert_with(|| {
            let mut params = self.base_params.clone();
            params.host = host.to_string();
            params.port = port;
            Arc::new(Client::new(params))
        });
        Arc::clone(entry.value())
    }

    fn resolve_slot(&self, spec: &SlotOpt, command: &[Bytes]) -> Result<u16, CoreError> {
        match spec {
            SlotOpt::Literal(slot) => {
                if *slot >= crc16::SLOT_COUNT {
                    return Err(CoreError::invalid_input("slot out of range"));
                }
                Ok(*slot)
            }
            SlotOpt::AutoSlot => Err(CoreError::invalid_input("AUTO_SLOT is not supported")),
            SlotOpt::KeyIndex(i) => {
                let idx = i.unsigned_abs() as usize;
                let key = command
                    .get(idx)
                    .ok_or_else(|| CoreError::invalid_input("slot key index out of range"))?;
                Ok(crc16::key_slot(key))
            }
            SlotOpt::AnyPrimary => Ok(rand::random::<u16>() % crc16::SLOT_COUNT),
        }
    }

    async fn ensure_table(&self) -> Result<Arc<RedisSlotsTable>, CoreError> {
        if let Some(table) = self.current_table() {
            return Ok(table);
        }
        self.refresh_table().await
    }

    fn current_table(&self) -> Option<Arc<RedisSlotsTable>> {
        if self.outdated.load(Ordering::Acquire) {
            return None;
        }
        self.table.read().clone()
    }

    async fn refresh_table(&self) -> Result<Arc<RedisSlotsTable>, CoreError> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(table) = self.current_table() {
            return Ok(table);
        }
        let candidates = self.refresh_seed_candidates();
        let mut last_err = None;
        for (host, port) in candidates {
            let client = self.client_for(&host, port);
            let cmd = vec![Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")];
            match client.execute(&cmd).await {
                Ok(value) => match parse_slots_table(&value, &host) {
                    Ok(table) => {
                        let table = Arc::new(table);
                        *self.table.write() = Some(Arc::clone(&table));
                        self.outdated.store(false, Ordering::Release);
                        return Ok(table);
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::new(ErrorKind::SysError, "no reachable cluster node")))
    }

    fn refresh_seed_candidates(&self) -> Vec<(String, u16)> {
        if let Some(table) = self.table.read().as_ref() {
            if !table.primaries.is_empty() {
                return table.primaries.iter().map(|n| (n.host.clone(), n.port)).collect();
            }
        }
        self.seeds.clone()
    }

    fn candidate_nodes(&self, group: &SlotRange, read_only: bool) -> Vec<(String, u16)> {
        if read_only && self.use_replica_reads && !group.replicas.is_empty() {
            let start = self.replica_cursor.fetch_add(1, Ordering::Relaxed) as usize % group.replicas.len();
            let mut list: Vec<(String, u16)> = (0..group.replicas.len())
                .map(|i| {
                    let r = &group.replicas[(start + i) % group.replicas.len()];
                    (r.host.clone(), r.port)
                })
                .collect();
            list.truncate(self.retry_max as usize);
            list
        } else {
            vec![(group.primary.host.clone(), group.primary.port)]
        }
    }

    async fn dispatch_to_group(
        &self,
        group: &SlotRange,
        read_only: bool,
        command: &[Bytes],
    ) -> Result<(RedisValue, String, u16), CoreError> {
        let candidates = self.candidate_nodes(group, read_only);
        let mut last_err = None;
        for (host, port) in candidates {
            let client = self.client_for(&host, port);
            match client.execute(command).await {
                Ok(value) => return Ok((value, host, port)),
                Err(e) if e.kind() == ErrorKind::SysError => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::new(ErrorKind::SysError, "no reachable node in slot group")))
    }

    async fn follow_redirects(
        &self,
        mut value: RedisValue,
        command: &[Bytes],
        mut host: String,
        mut port: u16,
    ) -> Result<RedisValue, CoreError> {
        let mut redirects = 0;
        loop {
            let Some(msg) = value.as_error_message() else {
                return Ok(value);
            };
            let Some(redirect) = parse_redirect(msg) else {
                return Ok(value);
            };
            if redirects >= 2 {
                return Err(CoreError::new(ErrorKind::TaskError, "too many cluster redirects"));
            }
            redirects += 1;
            match redirect {
                Redirect::Moved { host: new_host, port: new_port } => {
                    if self.table.read().is_some() {
                        self.outdated.store(true, Ordering::Release);
                    }
                    if !new_host.is_empty() {
                        host = new_host;
                    }
                    port = new_port;
                    let client = self.client_for(&host, port);
                    value = client.execute(command).await?;
                }
                Redirect::Ask { host: new_host, port: new_port } => {
                    if !new_host.is_empty() {
                        host = new_host;
                    }
                    port = new_port;
                    let client = self.client_for(&host, port);
                    let commands = vec![vec![Bytes::from_static(b"ASKING")], command.to_vec()];
                    let mut replies = client.execute_pipeline(&commands).await?;
                    value = replies.remove(1);
                }
            }
        }
    }

    pub async fn execute(&self, command: &[Bytes], opt: ExecuteOpt) -> Result<RedisValue, CoreError> {
        let slot = self.resolve_slot(&opt.slot, command)?;
        let table = self.ensure_table().await?;
        let group = table.group_for_slot(slot)?;
        let (value, host, port) = self.dispatch_to_group(group, opt.read_only, command).await?;
        self.follow_redirects(value, command, host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn node(host: &str, port: u16) -> RedisValue {
        RedisValue::Array(vec![
            RedisValue::BulkString(Bytes::copy_from_slice(host.as_bytes())),
            RedisValue::Integer(port as i64),
        ])
    }

    #[test]
    fn parses_a_slots_table_and_excludes_question_mark_hosts() {
        let reply = RedisValue::Array(vec![RedisValue::Array(vec![
            RedisValue::Integer(0),
            RedisValue::Integer(100),
            node("10.0.0.1", 6379),
            node("10.0.0.2", 6380),
            node("?", 0),
        ])]);
        let table = parse_slots_table(&reply, "seed-host").unwrap();
        assert_eq!(table.ranges.len(), 1);
        assert_eq!(table.ranges[0].primary.host, "10.0.0.1");
        assert_eq!(table.ranges[0].replicas.len(), 1);
        assert_eq!(table.primaries.len(), 1);
        assert_eq!(table.all_nodes.len(), 2);
    }

    #[test]
    fn null_host_falls_back_to_the_request_host() {
        let reply = RedisValue::Array(vec![RedisValue::Array(vec![
            RedisValue::Integer(0),
            RedisValue::Integer(16383),
            RedisValue::Array(vec![RedisValue::Null, RedisValue::Integer(6379)]),
        ])]);
        let table = parse_slots_table(&reply, "seed-host").unwrap();
        assert_eq!(table.ranges[0].primary.host, "seed-host");
    }

    #[test]
    fn parses_moved_and_ask_redirects() {
        match parse_redirect("MOVED 1234 10.0.0.5:6380").unwrap() {
            Redirect::Moved { host, port } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(port, 6380);
            }
            _ => panic!("expected MOVED"),
        }
        match parse_redirect("ASK 1234 10.0.0.6:6381").unwrap() {
            Redirect::Ask { host, port } => {
                assert_eq!(host, "10.0.0.6");
                assert_eq!(port, 6381);
            }
            _ => panic!("expected ASK"),
        }
        assert!(parse_redirect("ERR something else").is_none());
    }

    #[test]
    fn empty_host_in_a_redirect_is_detected_for_fallback() {
        match parse_redirect("MOVED 1234 :6380").unwrap() {
            Redirect::Moved { host, .. } => assert!(host.is_empty()),
            _ => panic!("expected MOVED"),
        }
    }

    #[test]
    fn group_for_slot_finds_the_owning_range() {
        let table = RedisSlotsTable {
            ranges: vec![
                SlotRange { start: 0, end: 100, primary: NodeInfo { host: "a".into(), port: 1, node_id: None }, replicas: vec![] },
                SlotRange { start: 101, end: 200, primary: NodeInfo { host: "b".into(), port: 2, node_id: None }, replicas: vec![] },
            ],
            primaries: vec![],
            all_nodes: vec![],
        };
        assert_eq!(table.group_for_slot(50).unwrap().primary.host, "a");
        assert_eq!(table.group_for_slot(150).unwrap().primary.host, "b");
        assert!(table.group_for_slot(300).is_err());
    }

    #[test]
    fn auto_slot_is_rejected() {
        let client = ClusterClient::new(vec![("seed".into(), 7000)], ClientParams::new("seed", 7000), 2, false);
        let err = client.resolve_slot(&SlotOpt::AutoSlot, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn key_index_hashes_the_referenced_argument() {
        let client = ClusterClient::new(vec![("seed".into(), 7000)], ClientParams::new("seed", 7000), 2, false);
        let command = vec![Bytes::from_static(b"GET"), Bytes::from_static(b"user:{42}")];
        let slot = client.resolve_slot(&SlotOpt::KeyIndex(-1), &command).unwrap();
        assert_eq!(slot, crc16::key_slot(b"user:{42}"));
    }

    #[tokio::test]
    async fn moved_redirect_is_followed_to_the_indicated_node() {
        let client = ClusterClient::new(vec![("nodeA".into(), 1)], ClientParams::new("nodeA", 1), 2, false);
        *client.table.write() = Some(Arc::new(RedisSlotsTable {
            ranges: vec![SlotRange {
                start: 0,
                end: 16383,
                primary: NodeInfo { host: "nodeA".into(), port: 1, node_id: None },
                replicas: vec![],
            }],
            primaries: vec![NodeInfo { host: "nodeA".into(), port: 1, node_id: None }],
            all_nodes: vec![],
        }));

        let (a_client_side, mut a_server_side) = tokio::io::duplex(4096);
        let (b_client_side, mut b_server_side) = tokio::io::duplex(4096);
        client
            .node_clients
            .insert(("nodeA".into(), 1), Arc::new(Client::from_connection(ClientParams::new("nodeA", 1), a_client_side)));
        client
            .node_clients
            .insert(("nodeB".into(), 2), Arc::new(Client::from_connection(ClientParams::new("nodeB", 2), b_client_side)));

        let node_a = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = a_server_side.read(&mut buf).await.unwrap();
            a_server_side.write_all(b"-MOVED 0 nodeB:2\r\n").await.unwrap();
        });
        let node_b = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = b_server_side.read(&mut buf).await.unwrap();
            b_server_side.write_all(b"+OK\r\n").await.unwrap();
        });

        let value = client
            .execute(&[Bytes::from_static(b"GET"), Bytes::from_static(b"k")], ExecuteOpt::write(SlotOpt::Literal(0)))
            .await
            .unwrap();
        assert_eq!(value, RedisValue::SimpleString("OK".into()));
        assert!(client.outdated.load(Ordering::Acquire));
        node_a.await.unwrap();
        node_b.await.unwrap();
    }
}
