//! Threaded ingestion: one fetch thread feeding one bounded queue per consumer.
//!
//! The fetch thread owns the event source and the unpacker. Every unpacked
//! event is shared (`Arc`) across all consumer queues, so each consumer sees
//! the full stream in fetch order. The pipeline ends on the first of:
//!
//! - a fetch failure (end of stream, I/O, decode or protocol error): queues
//!   are closed, consumers drain what was already queued, the failure is
//!   returned unless a consumer asked to stop while draining;
//! - a consumer failure: returned immediately;
//! - a consumer returning [`Flow::Stop`]: the pipeline completes successfully.

pub mod consumers;
pub mod queue;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use prometheus::{Counter, Gauge};

use self::queue::EventQueue;
use crate::export::health::HealthMetrics;
use crate::source::event::{Channel, TriggerEvent, TriggerKind, NUM_CHANNELS};
use crate::source::unpack::Unpacker;
use crate::source::EventSource;

/// What a consumer wants after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// No more events wanted; ends the whole pipeline.
    Stop,
}

/// Consumer processes unpacked events on its own thread.
pub trait Consumer: Send {
    /// Returns the consumer's name for logging and metrics labels.
    fn name(&self) -> &str;

    /// Handles one event. Errors are fatal to the pipeline.
    fn consume(&mut self, event: &TriggerEvent) -> Result<Flow>;
}

/// Tuning knobs of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Capacity of each consumer queue.
    pub queue_capacity: usize,
    /// Events fetched within this window after start are dropped unseen.
    pub discard_backlog: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: queue::DEFAULT_CAPACITY,
            discard_backlog: None,
        }
    }
}

type SharedQueue = Arc<EventQueue<Arc<TriggerEvent>>>;

enum Outcome {
    Fetch(Result<()>),
    Consumer { name: String, result: Result<Flow> },
}

/// Wires a source to a set of consumers.
pub struct Pipeline {
    source: Box<dyn EventSource>,
    unpacker: Unpacker,
    consumers: Vec<Box<dyn Consumer>>,
    options: PipelineOptions,
    health: Arc<HealthMetrics>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn EventSource>,
        unpacker: Unpacker,
        options: PipelineOptions,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            source,
            unpacker,
            consumers: Vec::new(),
            options,
            health,
        }
    }

    pub fn add_consumer(&mut self, consumer: Box<dyn Consumer>) {
        self.consumers.push(consumer);
    }

    /// Runs until the stream ends, a consumer fails, or a consumer stops.
    ///
    /// Returns `Ok` only when a consumer requested the stop.
    pub fn run(self) -> Result<()> {
        let Self {
            source,
            unpacker,
            consumers,
            options,
            health,
        } = self;

        if consumers.is_empty() {
            return Err(anyhow!("pipeline has no consumers"));
        }

        let (tx, rx) = mpsc::channel();
        let mut queues: Vec<SharedQueue> = Vec::with_capacity(consumers.len());

        for consumer in consumers {
            let name = consumer.name().to_string();
            let queue = Arc::new(EventQueue::new(options.queue_capacity));
            health
                .queue_capacity
                .with_label_values(&[name.as_str()])
                .set(queue.capacity() as f64);
            let length = health.queue_length.with_label_values(&[name.as_str()]);

            thread::Builder::new()
                .name(format!("consume-{name}"))
                .spawn({
                    let queue = Arc::clone(&queue);
                    let tx = tx.clone();
                    move || {
                        let result = drive(consumer, &queue, &length);
                        // Wake the fetcher if it is blocked on this queue.
                        queue.close();
                        let _ = tx.send(Outcome::Consumer { name, result });
                    }
                })
                .context("spawning consumer thread")?;

            queues.push(queue);
        }

        let consumer_count = queues.len();
        let fetch = Fetcher::new(source, unpacker, queues.clone(), options, &health);

        thread::Builder::new()
            .name("fetch".into())
            .spawn({
                let tx = tx.clone();
                move || {
                    let result = fetch.run();
                    let _ = tx.send(Outcome::Fetch(result));
                }
            })
            .context("spawning fetch thread")?;
        drop(tx);

        let mut fetch_result: Option<Result<()>> = None;
        let mut consumers_done = 0;

        while let Ok(outcome) = rx.recv() {
            match outcome {
                Outcome::Fetch(result) => {
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "fetch stopped, draining consumers");
                    }
                    fetch_result = Some(result);
                }
                Outcome::Consumer { name, result } => {
                    consumers_done += 1;
                    match result {
                        Ok(Flow::Stop) => {
                            tracing::info!(consumer = %name, "consumer finished, stopping pipeline");
                            close_all(&queues);
                            return Ok(());
                        }
                        Ok(Flow::Continue) => {
                            tracing::debug!(consumer = %name, "consumer drained");
                        }
                        Err(e) => {
                            close_all(&queues);
                            return Err(e.context(format!("consumer {name} failed")));
                        }
                    }
                }
            }

            if consumers_done == consumer_count {
                if let Some(result) = fetch_result.take() {
                    return match result {
                        Ok(()) => Err(anyhow!("event fetch ended")),
                        Err(e) => Err(e),
                    };
                }
            }
        }

        Err(anyhow!("pipeline threads exited without reporting"))
    }
}

fn close_all(queues: &[SharedQueue]) {
    for queue in queues {
        queue.close();
    }
}

fn drive(mut consumer: Box<dyn Consumer>, queue: &SharedQueue, length: &Gauge) -> Result<Flow> {
    while let Some(event) = queue.pop() {
        length.set(queue.len() as f64);
        if consumer.consume(&event)? == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

/// Position of a trigger's counter: channels first, then begin and end of spill.
fn trigger_slot(kind: TriggerKind) -> usize {
    match kind {
        TriggerKind::Channel(ch) => ch.index(),
        TriggerKind::BeginOfSpill => NUM_CHANNELS,
        TriggerKind::EndOfSpill => NUM_CHANNELS + 1,
    }
}

/// Fetch-thread state: source, unpacker and pre-resolved metric handles.
struct Fetcher {
    source: Box<dyn EventSource>,
    unpacker: Unpacker,
    queues: Vec<SharedQueue>,
    options: PipelineOptions,
    events_received: Counter,
    backlog_discarded: Counter,
    counter_anomalies: Counter,
    trigger_counters: Vec<Counter>,
    hit_counters: Vec<Counter>,
}

impl Fetcher {
    fn new(
        source: Box<dyn EventSource>,
        unpacker: Unpacker,
        queues: Vec<SharedQueue>,
        options: PipelineOptions,
        health: &HealthMetrics,
    ) -> Self {
        let trigger_counters = Channel::all()
            .map(|ch| ch.to_string())
            .chain(["begin_of_spill".to_string(), "end_of_spill".to_string()])
            .map(|label| health.events_by_trigger.with_label_values(&[label.as_str()]))
            .collect();
        let hit_counters = Channel::all()
            .map(|ch| {
                health
                    .hits_by_channel
                    .with_label_values(&[ch.to_string().as_str()])
            })
            .collect();

        Self {
            source,
            unpacker,
            queues,
            options,
            events_received: health.events_received.clone(),
            backlog_discarded: health.backlog_discarded.clone(),
            counter_anomalies: health.counter_anomalies.clone(),
            trigger_counters,
            hit_counters,
        }
    }

    fn run(mut self) -> Result<()> {
        let result = self.fetch_loop();
        close_all(&self.queues);
        result
    }

    fn fetch_loop(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut discarding = self.options.discard_backlog.is_some();

        loop {
            let raw = self
                .source
                .next_event()
                .with_context(|| format!("fetching from {}", self.source.name()))?;
            self.events_received.inc();

            if discarding {
                let window = self.options.discard_backlog.unwrap_or_default();
                if started.elapsed() < window {
                    self.backlog_discarded.inc();
                    continue;
                }
                tracing::info!(
                    discarded = self.backlog_discarded.get(),
                    "backlog window over, dispatching events",
                );
                discarding = false;
            }

            let event = self.unpacker.unpack(&raw).context("unpacking event")?;

            let anomalies = self.unpacker.take_anomalies();
            if anomalies > 0 {
                self.counter_anomalies.inc_by(anomalies as f64);
            }

            if let Some(counter) = self.trigger_counters.get(trigger_slot(event.kind)) {
                counter.inc();
            }
            if let Some(counter) = self.hit_counters.get(event.kind.channel().index()) {
                counter.inc_by(event.hits() as f64);
            }

            let event = Arc::new(event);
            for queue in &self.queues {
                if queue.push(Arc::clone(&event)).is_err() {
                    return Err(anyhow!("consumer queue closed"));
                }
            }
        }
    }
}
