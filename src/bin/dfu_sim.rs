use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use mesh_dfu::config::NodeConfig;
use mesh_dfu::dfu::{CampaignObserver, CampaignParams, CampaignReport, DistPhase, ImageInfo};
use mesh_dfu::network::Addr;
use mesh_dfu::sim::{ImageMetadata, SimNetwork, SimRunner, SimTarget, SimTargetOpts};

const IMAGE_SIZE: usize = 20 * 1024;
const RECEIVERS: [Addr; 4] = [0x0101, 0x0102, 0x0103, 0x0104];

struct PrintObserver;

impl CampaignObserver for PrintObserver {
    fn campaign_ended(&self, report: &CampaignReport) {
        println!(
            "\n🏁 Campaign ended: {:?} ({:?}), {} receivers",
            report.reason,
            report.phase,
            report.receivers.len()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => NodeConfig::default(),
    };
    mesh_dfu::metrics::init_metrics();

    println!("\n╔══════════════════════════════════════════════════════════════════╗");
    println!("║          Mesh DFU - Simulated Firmware Distribution              ║");
    println!("╚══════════════════════════════════════════════════════════════════╝\n");

    let net = SimNetwork::new(config.sim.clone());
    println!(
        "🌐 Network: {} receivers, {:.1}% loss, seed {:#x}",
        RECEIVERS.len(),
        config.sim.loss_rate * 100.0,
        config.sim.seed
    );

    let image: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i * 31 % 251) as u8).collect();
    let metadata = ImageMetadata::for_image(b"fw-2.0", &image);
    println!(
        "📦 Image: {} bytes, digest {}",
        image.len(),
        blake3::hash(&image).to_hex()
    );

    let mut runner = SimRunner::new(net.clone(), config.addr, config.distributor.clone());
    for (i, &addr) in RECEIVERS.iter().enumerate() {
        let opts = SimTargetOpts {
            fail_verify: i == RECEIVERS.len() - 1,
            ..Default::default()
        };
        let images = vec![ImageInfo {
            fwid: b"fw-1.0".to_vec(),
            uri: "mesh://fw".into(),
        }];
        runner.add_target(SimTarget::new(addr, &net, images, opts));
    }

    let distributor = runner.distributor_mut();
    distributor.set_observer(Arc::new(PrintObserver));
    let slot = distributor.add_slot(
        metadata.fwid.clone(),
        metadata.encode(),
        "mesh://fw-2.0".into(),
        Bytes::from(image),
    )?;
    for &addr in &RECEIVERS {
        distributor.receivers_add(addr, 0)?;
    }

    let mut phases = distributor.subscribe_phase();
    let watcher = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            println!("   ↳ distributor phase: {:?}", phase);
        }
    });

    println!("\n🚀 Starting campaign on slot {}...\n", slot);
    distributor.start(CampaignParams::new(slot))?;
    let phase = runner.run(500);
    let windows = runner.windows();

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  Addr     Phase            Failure                  Progress");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for row in runner.distributor().receivers() {
        let failure = row
            .failure
            .map(|f| format!("{:?}", f))
            .unwrap_or_else(|| "-".into());
        println!(
            "  {:#06x}   {:<16} {:<24} {:>3}%",
            row.addr,
            format!("{:?}", row.phase),
            failure,
            row.progress
        );
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for target in runner.targets() {
        let fwid = target.fwid(0).unwrap_or_default();
        println!(
            "  {:#06x}   running {}",
            target.addr(),
            String::from_utf8_lossy(fwid)
        );
    }
    println!("\n📊 Channel: {}", net.stats().summary());
    println!("⏱  Retransmission windows: {}", windows);

    drop(runner);
    watcher.await?;

    if phase != DistPhase::Completed {
        anyhow::bail!("campaign did not complete: {:?}", phase);
    }
    println!("\n✅ Campaign completed\n");
    Ok(())
}
