use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::info;

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::pipeline::consumers::{ReportConsumer, SpillAccumulator};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::sink::dump::DumpFile;
use crate::sink::tcp::TcpPublisher;
use crate::sink::{NullSink, Sink};
use crate::source::unpack::Unpacker;
use crate::source::{EventSource, FrameSource};
use crate::spill::report::ScalerMonitor;
use crate::spill::SpillTracker;

/// Agent orchestrates all components: source, pipeline, sink, health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    ///
    /// The configuration must already be validated.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self { cfg, health })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Runs until the event stream fails or a one-shot dump completes.
    ///
    /// Returns `Ok` only for a completed dump; every other ending is an error.
    pub fn run(self) -> Result<()> {
        // Serve probes before connecting, so a stuck source is observable.
        self.health
            .start()
            .context("starting health metrics server")?;

        let result = self.run_pipeline();

        self.health.stop();
        result
    }

    fn run_pipeline(&self) -> Result<()> {
        let settings = self.cfg.spill_settings();
        for channel in &settings.channels {
            info!(
                alias = %channel.alias,
                nbins = channel.nbins,
                max_range = channel.max_range,
                bin_width = channel.bin_width,
                "channel configured",
            );
        }

        let tracker = SpillTracker::new(&settings).context("creating spill tracker")?;
        let sink = self.build_sink()?;
        let source = self.build_source()?;

        let mut pipeline = Pipeline::new(
            source,
            Unpacker::new(self.cfg.spill.lost_hit_policy),
            PipelineOptions {
                queue_capacity: self.cfg.pipeline.queue_capacity,
                discard_backlog: self.cfg.discard_backlog(),
            },
            Arc::clone(&self.health),
        );

        let console = Arc::new(Mutex::new(()));
        pipeline.add_consumer(Box::new(SpillAccumulator::new(
            tracker,
            sink,
            settings.clock_hz,
            Arc::clone(&self.health),
            Arc::clone(&console),
        )));

        if self.cfg.pipeline.monitor {
            let names = settings.channels.iter().map(|c| c.alias.clone()).collect();
            pipeline.add_consumer(Box::new(ReportConsumer::new(
                ScalerMonitor::new(names, settings.clock_hz),
                console,
            )));
        }

        info!(
            policy = ?self.cfg.spill.lost_hit_policy,
            monitor = self.cfg.pipeline.monitor,
            "pipeline started",
        );

        pipeline.run()
    }

    fn build_sink(&self) -> Result<Box<dyn Sink>> {
        let publish = &self.cfg.publish;

        if publish.dump {
            info!(path = %publish.dump_path.display(), "capturing one spill, then exiting");
            return Ok(Box::new(DumpFile::new(publish.dump_path.clone())));
        }

        if publish.enabled {
            let addr = resolve(&publish.host, publish.port)?;
            let publisher = TcpPublisher::bind(addr, publish.send_timeout)
                .context("starting snapshot publisher")?;
            return Ok(Box::new(publisher));
        }

        info!("snapshot publishing disabled");
        Ok(Box::new(NullSink))
    }

    fn build_source(&self) -> Result<Box<dyn EventSource>> {
        let source = &self.cfg.source;

        match &source.replay {
            Some(path) => Ok(Box::new(FrameSource::open(path)?)),
            None => Ok(Box::new(FrameSource::connect(&source.address)?)),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving publish address {host}:{port}"))?
        .next()
        .with_context(|| format!("no address for {host}:{port}"))
}
