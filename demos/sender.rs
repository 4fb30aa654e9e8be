//! This example starts a metrics engine shipping to a local UDP backend and records a few
//! metrics, both directly and through the `metrics` macros.
//!
//! Run a listener first, for example `nc -klu 8123`, to watch the flushed points arrive as
//! JSON datagrams every five seconds.

use metrics::{counter, gauge, histogram};
use metrics_dispatch::{
    AggregationKind, FlushPolicy, MetricsEngine, Settings, StatsRecorder, StatsSink, Tags,
};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = Settings::new("127.0.0.1", 8123, "udp")
        .tag("ksid", "sender-demo")
        .runtime(true)
        .runtime_interval("5s");
    let engine = match MetricsEngine::new(settings) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Failed to configure the metrics engine: {e}");
            return;
        }
    };

    if let Err(e) = engine.start() {
        eprintln!("Failed to start the metrics engine: {e}");
        return;
    }

    let recorder = match StatsRecorder::new(Arc::clone(&engine) as Arc<dyn StatsSink>)
        .schedule("@every 5s")
    {
        Ok(recorder) => recorder,
        Err(e) => {
            eprintln!("Failed to build the metrics recorder: {e}");
            return;
        }
    };
    if let Err(e) = recorder.install() {
        eprintln!("Failed to set up metrics recorder: {e}");
        return;
    }

    let tags = Tags::from([("method".to_string(), "GET".to_string())]);
    for round in 0..12_u32 {
        for _ in 0..=round {
            if let Err(e) =
                engine.increment("demo.requests", &tags, "@every 5s", FlushPolicy::WINDOWED)
            {
                eprintln!("Failed to count a request: {e}");
            }
        }
        if let Err(e) = engine.record_value(
            "demo.latency",
            &tags,
            AggregationKind::Average,
            "@every 5s",
            FlushPolicy::WINDOWED,
            f64::from(round) * 1.5,
        ) {
            eprintln!("Failed to record latency: {e}");
        }

        counter!("demo.jobs").increment(1);
        gauge!("demo.queue").set(f64::from(round % 4));
        histogram!("demo.job_duration").record(42.0);

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    engine.shutdown().await;
    println!("Metrics recorded and sent to the UDP backend.");
}
