//! BLOB client and servers talking over the simulated mesh.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use mesh_dfu::blob::{
    BlobCaps, BlobCliConfig, BlobCliHandler, BlobClient, BlobError, BlobInputs, BlobServer,
    BlobSrvConfig, BlobSrvHandler, CliPhase, CliStage, LostReason, ServerPhase,
};
use mesh_dfu::chunk::{
    Block, Chunk, ChunkBuf, DataSink, IoMode, MemorySink, SinkResult, Transfer, XferMode,
    BLOCK_SIZE_MIN,
};
use mesh_dfu::network::{Addr, Message};
use mesh_dfu::settings::MemoryStore;
use mesh_dfu::sim::{DropFilter, SimConfig, SimNetwork};

const CLIENT: Addr = 0x0001;

#[derive(Default)]
struct CliLog {
    caps: Vec<Option<BlobCaps>>,
    lost: Vec<(Addr, LostReason)>,
    ended: Vec<(u64, bool)>,
    suspended: u32,
}

impl BlobCliHandler for CliLog {
    fn caps(&mut self, caps: Option<&BlobCaps>) {
        self.caps.push(caps.copied());
    }

    fn lost_target(&mut self, addr: Addr, reason: LostReason) {
        self.lost.push((addr, reason));
    }

    fn suspended(&mut self) {
        self.suspended += 1;
    }

    fn end(&mut self, xfer: &Transfer, success: bool) {
        self.ended.push((xfer.id, success));
    }
}

#[derive(Default)]
struct SrvLog {
    ended: Vec<(u64, bool)>,
}

impl BlobSrvHandler for SrvLog {
    fn end(&mut self, id: u64, success: bool) {
        self.ended.push((id, success));
    }
}

/// Records the block of every chunk write, in order.
#[derive(Clone)]
struct OrderedSink {
    inner: MemorySink,
    writes: Arc<Mutex<Vec<u16>>>,
}

impl DataSink for OrderedSink {
    fn open(&mut self, xfer: &Transfer, mode: IoMode) -> SinkResult<()> {
        self.inner.open(xfer, mode)
    }

    fn block_start(&mut self, xfer: &Transfer, block: &Block) -> SinkResult<()> {
        self.inner.block_start(xfer, block)
    }

    fn read(&mut self, xfer: &Transfer, block: &Block, chunk: &mut ChunkBuf<'_>) -> SinkResult<()> {
        self.inner.read(xfer, block, chunk)
    }

    fn write(&mut self, xfer: &Transfer, block: &Block, chunk: &Chunk<'_>) -> SinkResult<()> {
        self.writes.lock().push(block.number);
        self.inner.write(xfer, block, chunk)
    }
}

struct Node {
    server: BlobServer<SrvLog>,
    sink: MemorySink,
}

struct Mesh {
    net: SimNetwork,
    client: BlobClient<CliLog>,
    nodes: BTreeMap<Addr, Node>,
}

impl Mesh {
    fn new(config: SimConfig, addrs: &[Addr]) -> Self {
        let net = SimNetwork::new(config);
        let client = BlobClient::new(BlobCliConfig::default(), net.link(CLIENT), CliLog::default());
        let nodes = addrs
            .iter()
            .map(|&addr| {
                let server = BlobServer::new(
                    BlobSrvConfig::default(),
                    net.link(addr),
                    Arc::new(MemoryStore::new()),
                    SrvLog::default(),
                );
                let node = Node {
                    server,
                    sink: MemorySink::new().with_erase(),
                };
                (addr, node)
            })
            .collect();
        Self { net, client, nodes }
    }

    fn arm(&mut self, id: u64) {
        for node in self.nodes.values_mut() {
            node.server
                .recv(id, Box::new(node.sink.clone()), 5, 10)
                .unwrap();
        }
    }

    fn node(&self, addr: Addr) -> &Node {
        &self.nodes[&addr]
    }

    /// Deliver one transmit completion or one message.
    fn step(&mut self) -> bool {
        let completed = self.net.take_tx_complete(CLIENT);
        if completed > 0 {
            for _ in 0..completed {
                self.client.tx_complete();
            }
            return true;
        }
        let Some(env) = self.net.pop() else {
            return false;
        };
        let Message::Blob(msg) = env.decode().unwrap() else {
            return true;
        };
        if env.node == CLIENT {
            self.client.handle_message(&env.ctx, &msg);
        } else if let Some(node) = self.nodes.get_mut(&env.node) {
            node.server.handle_message(&env.ctx, &msg);
        }
        true
    }

    fn pump(&mut self) {
        while self.step() {}
    }

    /// Run until the client is idle, firing its retry timer on quiescence.
    fn run(&mut self, max_windows: u32) {
        for _ in 0..max_windows {
            self.pump();
            if self.client.is_idle() {
                return;
            }
            self.client.retry_timeout();
        }
        self.pump();
    }

    /// Like `run`, resuming a transfer that suspended as a whole.
    fn run_to_end(&mut self, max_windows: u32) {
        self.run(max_windows);
        for _ in 0..3 {
            if self.client.phase() != CliPhase::Suspended {
                return;
            }
            self.client.resume().unwrap();
            self.run(max_windows);
        }
    }
}

fn image(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn source(data: &[u8]) -> Box<dyn DataSink> {
    Box::new(MemorySink::from_bytes(data.to_vec().into()))
}

#[test]
fn two_block_push_transfer() {
    let mut mesh = Mesh::new(SimConfig::perfect(), &[0x0100]);
    let data = image(2 * BLOCK_SIZE_MIN as usize);
    let xfer = Transfer::new(1, data.len() as u32, 12, 377, XferMode::Push);

    let node = mesh.nodes.get_mut(&0x0100).unwrap();
    node.server.recv(1, Box::new(node.sink.clone()), 0, 10).unwrap();

    mesh.client
        .send(BlobInputs::unicast(vec![0x0100]), xfer, source(&data))
        .unwrap();
    mesh.run(10);

    let node = mesh.node(0x0100);
    assert_eq!(node.server.phase(), ServerPhase::Complete);
    assert_eq!(node.server.handler().ended.last(), Some(&(1, true)));
    let blocks = node.server.blocks_received().unwrap();
    assert!(blocks.get(0) && blocks.get(1));
    assert_eq!(node.sink.contents(), data);
    assert_eq!(mesh.client.handler().ended, vec![(1, true)]);
    assert!(mesh.client.handler().lost.is_empty());
}

#[test]
fn caps_round_loses_silent_target() {
    let mut mesh = Mesh::new(SimConfig::perfect(), &[0x0100, 0x0200]);
    mesh.net.add_filter(DropFilter::to(0x0200));

    mesh.client
        .caps_get(BlobInputs::unicast(vec![0x0100, 0x0200]), false)
        .unwrap();
    mesh.run(10);

    let log = mesh.client.handler();
    assert_eq!(log.lost, vec![(0x0200, LostReason::Timeout(CliStage::Caps))]);
    assert_eq!(log.caps, vec![Some(BlobCaps::default())]);
    assert_eq!(mesh.client.caps_of(0x0100), Some(&BlobCaps::default()));
}

#[test]
fn silent_subset_does_not_fail_transfer() {
    let addrs = [0x0100, 0x0200, 0x0300];
    let mut mesh = Mesh::new(SimConfig::perfect(), &addrs);
    mesh.arm(7);
    // 0x0200 goes quiet once the transfer is underway.
    mesh.net
        .add_filter(DropFilter::by(0x0200).opcode("blob_block_status"));

    let data = image(3 * BLOCK_SIZE_MIN as usize + 100);
    let xfer = BlobCaps::default().transfer_for(7, data.len() as u32, XferMode::Push);
    mesh.client
        .send(BlobInputs::unicast(addrs.to_vec()), xfer, source(&data))
        .unwrap();
    mesh.run(100);

    let log = mesh.client.handler();
    assert_eq!(log.ended, vec![(7, true)]);
    assert_eq!(log.lost.len(), 1);
    assert_eq!(log.lost[0].0, 0x0200);
    for addr in [0x0100, 0x0300] {
        assert_eq!(mesh.node(addr).server.phase(), ServerPhase::Complete);
        assert_eq!(mesh.node(addr).sink.contents(), data);
    }
    assert_ne!(mesh.node(0x0200).server.phase(), ServerPhase::Complete);
}

#[test]
fn second_recv_is_refused_mid_transfer() {
    let mut mesh = Mesh::new(SimConfig::perfect(), &[0x0100]);
    mesh.arm(3);
    let data = image(2 * BLOCK_SIZE_MIN as usize);
    let xfer = BlobCaps::default().transfer_for(3, data.len() as u32, XferMode::Push);
    mesh.client
        .send(BlobInputs::unicast(vec![0x0100]), xfer, source(&data))
        .unwrap();

    while mesh.node(0x0100).server.phase() != ServerPhase::WaitingForChunk {
        assert!(mesh.step());
    }
    let node = mesh.nodes.get_mut(&0x0100).unwrap();
    assert!(matches!(
        node.server.recv(4, Box::new(MemorySink::new()), 5, 10),
        Err(BlobError::Busy)
    ));
    assert_eq!(node.server.transfer_id(), Some(3));

    mesh.run(10);
    assert_eq!(mesh.node(0x0100).server.phase(), ServerPhase::Complete);
    assert_eq!(mesh.node(0x0100).sink.contents(), data);
}

#[test]
fn chunks_reach_the_sink_in_block_order() {
    let mut mesh = Mesh::new(SimConfig::with_loss(0.05).seeded(11), &[0x0100]);
    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = OrderedSink {
        inner: MemorySink::new(),
        writes: writes.clone(),
    };
    mesh.nodes
        .get_mut(&0x0100)
        .unwrap()
        .server
        .recv(9, Box::new(sink.clone()), 5, 10)
        .unwrap();

    let data = image(4 * BLOCK_SIZE_MIN as usize);
    let xfer = BlobCaps::default().transfer_for(9, data.len() as u32, XferMode::Pull);
    mesh.client
        .send(BlobInputs::unicast(vec![0x0100]), xfer, source(&data))
        .unwrap();
    mesh.run_to_end(200);

    assert_eq!(mesh.client.handler().ended, vec![(9, true)]);
    assert_eq!(sink.inner.contents(), data);
    let writes = writes.lock();
    assert!(writes.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn pull_transfer_to_several_targets() {
    let addrs = [0x0100, 0x0200, 0x0300];
    let mut mesh = Mesh::new(SimConfig::perfect(), &addrs);
    mesh.arm(13);

    let data = image(3 * BLOCK_SIZE_MIN as usize + 200);
    let xfer = BlobCaps::default().transfer_for(13, data.len() as u32, XferMode::Pull);
    mesh.client
        .send(BlobInputs::unicast(addrs.to_vec()), xfer, source(&data))
        .unwrap();
    mesh.run(100);

    let log = mesh.client.handler();
    assert_eq!(log.ended, vec![(13, true)]);
    assert!(log.lost.is_empty());
    for addr in addrs {
        assert_eq!(mesh.node(addr).server.phase(), ServerPhase::Complete);
        assert_eq!(mesh.node(addr).sink.contents(), data);
    }
}

#[test]
fn target_going_silent_mid_block_is_dropped() {
    let mut mesh = Mesh::new(SimConfig::perfect(), &[0x0100, 0x0200]);
    mesh.arm(21);
    let data = image(3 * BLOCK_SIZE_MIN as usize);
    let xfer = BlobCaps::default().transfer_for(21, data.len() as u32, XferMode::Push);
    mesh.client
        .send(BlobInputs::unicast(vec![0x0100, 0x0200]), xfer, source(&data))
        .unwrap();

    while mesh.node(0x0100).sink.stats().chunks_written == 0 {
        assert!(mesh.step());
    }
    mesh.net.set_down(0x0200, true);
    mesh.run(200);

    let log = mesh.client.handler();
    assert_eq!(log.ended, vec![(21, true)]);
    assert_eq!(log.suspended, 0);
    assert_eq!(log.lost.len(), 1);
    assert_eq!(log.lost[0].0, 0x0200);
    assert_eq!(mesh.node(0x0100).server.phase(), ServerPhase::Complete);
    assert_eq!(mesh.node(0x0100).sink.contents(), data);
}

#[test]
fn suspend_and_resume_reproduce_the_image() {
    let mut mesh = Mesh::new(SimConfig::perfect(), &[0x0100]);
    mesh.arm(5);
    let data = image(4 * BLOCK_SIZE_MIN as usize + 17);
    let xfer = BlobCaps::default().transfer_for(5, data.len() as u32, XferMode::Push);
    let block_count = xfer.block_count();
    mesh.client
        .send(BlobInputs::unicast(vec![0x0100]), xfer, source(&data))
        .unwrap();

    let received = |mesh: &Mesh| {
        mesh.node(0x0100)
            .server
            .blocks_received()
            .map_or(0, |b| b.count())
    };
    while received(&mesh) < 2 {
        assert!(mesh.step());
    }
    mesh.client.suspend();
    mesh.pump();
    assert_eq!(mesh.client.handler().suspended, 1);

    let node = mesh.nodes.get_mut(&0x0100).unwrap();
    for _ in 0..BlobSrvConfig::default().suspend_after_windows {
        node.server.link_timeout();
    }
    assert_eq!(node.server.phase(), ServerPhase::Suspended);

    mesh.client.resume().unwrap();
    mesh.run(20);

    let node = mesh.node(0x0100);
    assert_eq!(node.server.phase(), ServerPhase::Complete);
    assert_eq!(node.sink.contents(), data);
    assert!(node.sink.stats().blocks_started <= block_count + 1);
    assert_eq!(mesh.client.handler().ended, vec![(5, true)]);
}

#[test]
fn lossy_mesh_delivers_identical_images() {
    let addrs = [0x0100, 0x0200, 0x0300, 0x0400];
    let mut mesh = Mesh::new(SimConfig::with_loss(0.05).seeded(42), &addrs);
    mesh.arm(11);

    let data = image(5 * BLOCK_SIZE_MIN as usize - 3);
    let xfer = BlobCaps::default().transfer_for(11, data.len() as u32, XferMode::Push);
    mesh.client
        .send(BlobInputs::unicast(addrs.to_vec()), xfer, source(&data))
        .unwrap();
    mesh.run_to_end(500);

    let log = mesh.client.handler();
    assert_eq!(log.ended, vec![(11, true)]);
    let mut lost: Vec<Addr> = log.lost.iter().map(|(a, _)| *a).collect();
    lost.sort_unstable();
    lost.dedup();
    assert_eq!(lost.len(), log.lost.len());
    assert!(lost.len() < addrs.len());

    for addr in addrs.iter().filter(|a| !lost.contains(a)) {
        assert_eq!(mesh.node(*addr).server.phase(), ServerPhase::Complete);
        assert_eq!(mesh.node(*addr).sink.contents(), data);
    }
}
