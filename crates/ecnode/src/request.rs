//! Request pipeline: receive, prepare, operate, post, respond.
//!
//!   accept_loop → spawn(handle_client) → read_packet → process → write_packet
//!
//! Each connection is served by one task, one packet at a time. Every
//! packet moves through the stages of [`Stage`]; a failure in prepare
//! skips straight to post, so every packet gets exactly one response.

use std::sync::Arc;
use std::time::Instant;

use ecnode_core::codec::{read_packet, write_packet};
use ecnode_proto::constants::PROTO_MAGIC;
use ecnode_proto::defaults::DEFAULT_MAX_PAYLOAD_SIZE;
use ecnode_proto::{EcError, EcResult, Opcode, Packet, ResultCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, error, info, warn};

use crate::node::{EcNode, SharedNode};
use crate::ops::{self, OpError};
use crate::partition::EcPartition;

/// Lifecycle position of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Prepared,
    Operated,
    Posted,
    Responded,
}

/// A packet in flight through the pipeline.
pub struct Request {
    pub packet: Packet,
    /// Target partition, resolved in prepare for partition-scoped opcodes.
    pub partition: Option<Arc<EcPartition>>,
    pub stage: Stage,
    /// Share of the partition's operation barrier, released in post.
    op_guard: Option<OwnedRwLockReadGuard<()>>,
    received_at: Instant,
}

impl Request {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            partition: None,
            stage: Stage::Received,
            op_guard: None,
            received_at: Instant::now(),
        }
    }

    fn fail(&mut self, err: OpError) {
        let msg = if err.msg.is_empty() {
            err.code.to_string()
        } else {
            err.msg
        };
        self.packet.pack_err(err.code, msg);
    }
}

/// Accept connections until the node is shut down.
pub async fn accept_loop(node: SharedNode, listener: TcpListener) -> EcResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }
    let shutdown_notify = node.shutdown_notify.clone();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(node, stream).await {
                                debug!("client {} disconnected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown_notify.notified() => {
                info!("accept loop shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Serve one connection: read packets, process, send responses.
///
/// A clean close between packets ends the loop normally, as does the read
/// deadline expiring (idle pooled links from primaries hit it routinely).
/// A malformed read drops the connection since framing can't be trusted.
async fn handle_client(node: SharedNode, mut stream: TcpStream) -> EcResult<()> {
    let deadline = node.config.client_read_timeout;
    loop {
        let packet = match read_packet(&mut stream, deadline).await {
            Ok(p) => p,
            Err(EcError::NetworkError) => return Ok(()),
            Err(EcError::Timeout) => {
                debug!("closing idle connection after {:?}", deadline);
                return Ok(());
            }
            Err(e) => {
                warn!("dropping connection: {}", e);
                return Err(e);
            }
        };

        let mut req = process(&node, packet).await;

        write_packet(&mut stream, &req.packet).await?;
        req.stage = Stage::Responded;
    }
}

/// Drive one packet through prepare, operate and post.
pub async fn process(node: &EcNode, packet: Packet) -> Request {
    let mut req = Request::new(packet);

    match prepare(node, &mut req).await {
        Ok(op) => {
            if let Err(e) = ops::operate(node, &mut req, op).await {
                req.fail(e);
            }
            req.stage = Stage::Operated;
        }
        Err(e) => req.fail(e),
    }

    post(node, &mut req);
    req
}

/// Validate the packet and, for partition-scoped opcodes, resolve the
/// partition and enter its operation barrier.
pub async fn prepare(node: &EcNode, req: &mut Request) -> Result<Opcode, OpError> {
    let p = &req.packet;
    if p.magic != PROTO_MAGIC {
        return Err(OpError::new(EcError::MalformedPacket, "bad magic"));
    }
    if p.size > DEFAULT_MAX_PAYLOAD_SIZE {
        return Err(OpError::new(
            EcError::MalformedPacket,
            format!("size {} over limit", p.size),
        ));
    }
    if !p.is_read_request() && p.data.len() != p.size as usize {
        return Err(OpError::new(
            EcError::MalformedPacket,
            format!("payload is {} bytes, header says {}", p.data.len(), p.size),
        ));
    }

    let op = p.op().map_err(|e| {
        OpError::new(e, format!("unknown opcode {:#04x}", p.opcode))
    })?;

    if op.is_partition_scoped() {
        let partition_id = p.partition_id;
        let not_found = || {
            OpError::new(
                EcError::NotFound,
                format!(
                    "partition {} not found on {}",
                    partition_id,
                    node.local_addr()
                ),
            )
        };
        let partition = node
            .space
            .partition(partition_id)
            .await
            .map_err(|_| not_found())?;
        let guard = partition.begin_op().await.map_err(|_| not_found())?;
        req.partition = Some(partition);
        req.op_guard = Some(guard);
    }

    req.stage = Stage::Prepared;
    Ok(op)
}

/// Finish a request: make sure it carries a result, release the barrier
/// and account latency.
pub fn post(node: &EcNode, req: &mut Request) {
    if req.packet.result_code == ResultCode::Init {
        error!("{} finished without a result", req.packet);
        req.packet.pack_err(EcError::Internal, "handler left no result");
    }
    req.op_guard = None;

    let elapsed = req.received_at.elapsed();
    if elapsed >= node.config.slow_request {
        warn!(
            "slow request {}: {:?} after {:?}, result {}",
            req.packet,
            elapsed,
            req.stage,
            req.packet.get_result_msg()
        );
    } else {
        debug!(
            "{} done in {:?} after {:?}: {}",
            req.packet,
            elapsed,
            req.stage,
            req.packet.get_result_msg()
        );
    }
    req.stage = Stage::Posted;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskConfig, NodeConfig};
    use crate::replication::tests::{dead_addr, spawn_follower, Behavior};
    use ecnode_core::tcp_transport::TcpTransport;
    use ecnode_core::transport::PeerTransport;
    use ecnode_proto::constants::PACKET_HEADER_SIZE;
    use ecnode_proto::packet::crc32;
    use ecnode_proto::{AdminTask, CreateEcPartitionRequest, DeleteEcPartitionRequest, ExtentInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    const PID: u64 = 10;
    const UNIT: usize = 4096;

    async fn start_node(disk: &TempDir, local: &str) -> SharedNode {
        let config = NodeConfig::new(local, local, vec![DiskConfig::new(disk.path(), 100 << 30)])
            .with_replica_timeout_ms(2000);
        let transport: Arc<dyn PeerTransport> = Arc::new(TcpTransport::new(4));
        EcNode::start(config, transport).await.unwrap()
    }

    fn create_partition_packet(hosts: &[String], operator: &str) -> Packet {
        create_partition_packet_with(hosts, operator, 2)
    }

    fn create_partition_packet_with(hosts: &[String], operator: &str, parity: u32) -> Packet {
        let task = AdminTask::new(
            Opcode::CreateEcPartition,
            operator,
            CreateEcPartitionRequest {
                partition_id: PID,
                partition_size: 5 << 30,
                volume_id: "vol".to_string(),
                stripe_unit_size: UNIT as u64,
                extent_file_size: 64 << 20,
                data_node_num: hosts.len() as u32 - parity,
                parity_node_num: parity,
                hosts: hosts.to_vec(),
            },
        );
        Packet::new_request(Opcode::CreateEcPartition, PID, 0).with_data(task.to_json().unwrap())
    }

    /// A primary with a 4+2 partition whose five followers behave as given.
    async fn primary_with(disk: &TempDir, followers: Vec<String>) -> SharedNode {
        let local = "127.0.0.1:1".to_string();
        let node = start_node(disk, &local).await;
        let mut hosts = vec![local.clone()];
        hosts.extend(followers);
        let req = process(&node, create_partition_packet(&hosts, &local)).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());
        node
    }

    async fn ok_followers(n: usize) -> Vec<String> {
        let mut hosts = Vec::new();
        for _ in 0..n {
            hosts.push(spawn_follower(Behavior::Ok).await);
        }
        hosts
    }

    #[tokio::test]
    async fn test_extent_lifecycle() {
        let disk = tempfile::tempdir().unwrap();
        let node = primary_with(&disk, ok_followers(5).await).await;

        let req = process(&node, Packet::new_request(Opcode::CreateExtent, PID, 1025)).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());
        assert_eq!(req.packet.extent_id, 1025);
        assert_eq!(req.stage, Stage::Posted);

        let req = process(&node, Packet::new_request(Opcode::ExtentInfo, PID, 1025)).await;
        let info: ExtentInfo = serde_json::from_slice(&req.packet.data).unwrap();
        assert_eq!(info.size, 0);

        let zeros = vec![0u8; UNIT];
        let write = Packet::new_request(Opcode::Write, PID, 1025).with_data(zeros.clone());
        let req = process(&node, write).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());
        assert!(req.packet.data.is_empty());

        let mut read = Packet::new_request(Opcode::Read, PID, 1025);
        read.size = UNIT as u32;
        let req = process(&node, read).await;
        assert!(req.packet.is_ok());
        assert_eq!(req.packet.data, zeros);
        assert_eq!(req.packet.crc, crc32(&zeros));
    }

    #[tokio::test]
    async fn test_create_extent_allocates_id() {
        let disk = tempfile::tempdir().unwrap();
        let node = primary_with(&disk, ok_followers(5).await).await;

        let req = process(&node, Packet::new_request(Opcode::CreateExtent, PID, 0)).await;
        assert!(req.packet.is_ok());
        assert!(req.packet.extent_id > 1024);
    }

    #[tokio::test]
    async fn test_oversize_write() {
        let disk = tempfile::tempdir().unwrap();
        let node = primary_with(&disk, ok_followers(5).await).await;
        process(&node, Packet::new_request(Opcode::CreateExtent, PID, 1025)).await;

        let data = vec![1u8; 2 * UNIT];
        let write = Packet::new_request(Opcode::Write, PID, 1025)
            .with_offset((64 << 20) - UNIT as u64)
            .with_data(data);
        let req = process(&node, write).await;
        assert_eq!(req.packet.result(), Err(EcError::SizeExceeded));

        let partition = node.space.partition(PID).await.unwrap();
        assert_eq!(partition.extent_info(1025).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_bad_crc_not_replicated() {
        let disk = tempfile::tempdir().unwrap();
        // Had the write been forwarded first, this follower would turn the
        // result into a replication failure.
        let mut followers = ok_followers(4).await;
        followers.push(spawn_follower(Behavior::Reject(EcError::Io)).await);
        let node = primary_with(&disk, followers).await;

        let partition = node.space.partition(PID).await.unwrap();
        partition.create_local_extent(1025).await.unwrap();

        let mut write = Packet::new_request(Opcode::Write, PID, 1025).with_data(vec![1u8; UNIT]);
        write.crc ^= 0xFFFF;
        let req = process(&node, write).await;
        assert_eq!(req.packet.result(), Err(EcError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_follower_down() {
        let disk = tempfile::tempdir().unwrap();
        let mut followers = ok_followers(4).await;
        followers.push(dead_addr().await);
        let node = primary_with(&disk, followers).await;

        let req = process(&node, Packet::new_request(Opcode::CreateExtent, PID, 1025)).await;
        assert_eq!(req.packet.result(), Err(EcError::ReplicationNetwork));
        assert!(req.packet.get_result_msg().contains("replication failed"));

        // The local copy is kept.
        let partition = node.space.partition(PID).await.unwrap();
        assert!(partition.extent_info(1025).await.is_ok());
    }

    #[tokio::test]
    async fn test_forwarded_ops_stay_local() {
        let disk = tempfile::tempdir().unwrap();
        // Every follower is unreachable; forwarded packets must not care.
        let mut followers = Vec::new();
        for _ in 0..5 {
            followers.push(dead_addr().await);
        }
        let node = primary_with(&disk, followers).await;

        let create = Packet::new_request(Opcode::CreateExtent, PID, 1030).forward_copy();
        let req = process(&node, create).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());

        let data = vec![6u8; UNIT];
        let write = Packet::new_request(Opcode::Write, PID, 1030)
            .with_data(data)
            .forward_copy();
        let req = process(&node, write).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());
    }

    #[tokio::test]
    async fn test_prepare_rejections() {
        let disk = tempfile::tempdir().unwrap();
        let node = start_node(&disk, "127.0.0.1:1").await;

        let mut unknown = Packet::new_request(Opcode::Write, PID, 1025);
        unknown.opcode = 0x77;
        let req = process(&node, unknown).await;
        assert_eq!(req.packet.result(), Err(EcError::NoSupport));
        assert_eq!(req.stage, Stage::Posted);

        let req = process(&node, Packet::new_request(Opcode::CreateExtent, 99, 1025)).await;
        assert_eq!(req.packet.result(), Err(EcError::NotFound));
        assert!(req.packet.get_result_msg().contains("partition 99"));

        let mut bad_magic = Packet::new_request(Opcode::CreateExtent, PID, 1025);
        bad_magic.magic = 0x42;
        let req = process(&node, bad_magic).await;
        assert_eq!(req.packet.result(), Err(EcError::MalformedPacket));

        let mut short = Packet::new_request(Opcode::Write, PID, 1025).with_data(vec![0; 16]);
        short.size = 32;
        let req = process(&node, short).await;
        assert_eq!(req.packet.result(), Err(EcError::MalformedPacket));

        let garbage = Packet::new_request(Opcode::CreateEcPartition, 0, 0).with_data(b"{".to_vec());
        let req = process(&node, garbage).await;
        assert_eq!(req.packet.result(), Err(EcError::InvalidArgument));
    }

    #[tokio::test]
    async fn test_duplicate_and_delete_partition() {
        let disk = tempfile::tempdir().unwrap();
        let local = "127.0.0.1:1";
        let node = start_node(&disk, local).await;
        let mut hosts = vec![local.to_string()];
        hosts.extend(ok_followers(5).await);

        assert!(process(&node, create_partition_packet(&hosts, local)).await.packet.is_ok());
        let dup = process(&node, create_partition_packet(&hosts, local)).await;
        assert_eq!(dup.packet.result(), Err(EcError::AlreadyExists));

        let task = AdminTask::new(
            Opcode::DeleteEcPartition,
            local,
            DeleteEcPartitionRequest { partition_id: PID },
        );
        let delete = Packet::new_request(Opcode::DeleteEcPartition, PID, 0)
            .with_data(task.to_json().unwrap());
        assert!(process(&node, delete).await.packet.is_ok());

        let req = process(&node, Packet::new_request(Opcode::CreateExtent, PID, 1025)).await;
        assert_eq!(req.packet.result(), Err(EcError::NotFound));
    }

    /// A follower that logs the first payload byte of every forwarded
    /// write as it applies it. The first write is held back by `stall`.
    async fn spawn_recording_follower(stall: Duration) -> (String, Arc<Mutex<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let writes = Arc::new(AtomicUsize::new(0));
        let log = applied.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = log.clone();
                let writes = writes.clone();
                tokio::spawn(async move {
                    while let Ok(mut p) = read_packet(&mut stream, None).await {
                        if p.op() == Ok(Opcode::Write) {
                            if writes.fetch_add(1, Ordering::SeqCst) == 0 {
                                tokio::time::sleep(stall).await;
                            }
                            log.lock().unwrap().push(p.data[0]);
                        }
                        p.pack_ok();
                        if write_packet(&mut stream, &p).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, applied)
    }

    #[tokio::test]
    async fn test_same_extent_writes_reach_followers_in_order() {
        let disk = tempfile::tempdir().unwrap();
        let local = "127.0.0.1:1";
        let node = start_node(&disk, local).await;
        let (follower, applied) = spawn_recording_follower(Duration::from_millis(300)).await;
        let hosts = vec![local.to_string(), follower];

        let req = process(&node, create_partition_packet_with(&hosts, local, 1)).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());
        let req = process(&node, Packet::new_request(Opcode::CreateExtent, PID, 1025)).await;
        assert!(req.packet.is_ok(), "{}", req.packet.get_result_msg());

        let write = |byte: u8| {
            let node = node.clone();
            tokio::spawn(async move {
                let p = Packet::new_request(Opcode::Write, PID, 1025).with_data(vec![byte; UNIT]);
                process(&node, p).await.packet.result()
            })
        };
        let first = write(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = write(2);

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));

        // Primary and follower both end with the later write.
        assert_eq!(*applied.lock().unwrap(), vec![1, 2]);
        let partition = node.space.partition(PID).await.unwrap();
        let (data, _) = partition.read(1025, 0, UNIT as u64).await.unwrap();
        assert_eq!(data, vec![2u8; UNIT]);
    }

    #[tokio::test]
    async fn test_idle_connection_closes_quietly() {
        let disk = tempfile::tempdir().unwrap();
        let local = "127.0.0.1:1";
        let config = NodeConfig::new(local, local, vec![DiskConfig::new(disk.path(), 1 << 30)])
            .with_read_timeout_ms(100);
        let node = EcNode::start(config, Arc::new(TcpTransport::new(1)))
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let idle = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        assert_eq!(handle_client(node.clone(), server).await, Ok(()));
        drop(idle);

        let mut garbled = TcpStream::connect(addr).await.unwrap();
        garbled.write_all(&[0x42; PACKET_HEADER_SIZE]).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        assert_eq!(
            handle_client(node, server).await,
            Err(EcError::MalformedPacket)
        );
    }

    /// Two real nodes over TCP: a write admitted by the primary can be
    /// read back from the follower.
    #[tokio::test]
    async fn test_two_nodes_end_to_end() {
        let listeners = [
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
        ];
        let addrs: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect();

        let disks = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];
        let mut nodes = Vec::new();
        for ((listener, addr), disk) in listeners.into_iter().zip(&addrs).zip(&disks) {
            let node = start_node(disk, addr).await;
            tokio::spawn(accept_loop(node.clone(), listener));
            nodes.push(node);
        }

        let client = TcpTransport::new(1);
        let call = |addr: String, p: Packet| {
            let client = &client;
            async move { client.send_packet(&addr, &p).await.unwrap() }
        };

        // 1+1 geometry: the controller creates the partition on each host.
        for addr in &addrs {
            let task = AdminTask::new(
                Opcode::CreateEcPartition,
                addr,
                CreateEcPartitionRequest {
                    partition_id: PID,
                    partition_size: 1 << 30,
                    volume_id: "vol".to_string(),
                    stripe_unit_size: UNIT as u64,
                    extent_file_size: 64 << 20,
                    data_node_num: 1,
                    parity_node_num: 1,
                    hosts: addrs.clone(),
                },
            );
            let p = Packet::new_request(Opcode::CreateEcPartition, PID, 0)
                .with_data(task.to_json().unwrap());
            assert!(call(addr.clone(), p).await.is_ok());
        }

        let primary = addrs[0].clone();
        let follower = addrs[1].clone();

        let reply = call(primary.clone(), Packet::new_request(Opcode::CreateExtent, PID, 0)).await;
        assert!(reply.is_ok(), "{}", reply.get_result_msg());
        let extent_id = reply.extent_id;

        let data: Vec<u8> = (0..2 * UNIT).map(|i| (i % 251) as u8).collect();
        let write = Packet::new_request(Opcode::Write, PID, extent_id)
            .with_offset(UNIT as u64)
            .with_data(data.clone());
        let reply = call(primary.clone(), write).await;
        assert!(reply.is_ok(), "{}", reply.get_result_msg());

        let mut read = Packet::new_request(Opcode::Read, PID, extent_id).with_offset(UNIT as u64);
        read.size = data.len() as u32;
        let reply = call(follower.clone(), read).await;
        assert!(reply.is_ok(), "{}", reply.get_result_msg());
        assert_eq!(reply.data, data);
        assert_eq!(reply.crc, crc32(&data));

        for node in &nodes {
            node.shutdown().await.unwrap();
        }
    }
}
