use anyhow::{Context, Result};
use csvstream::{csv_record, Decoder, DecoderConfig};
use std::{env, fs::File, time::Instant};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

csv_record! {
    #[derive(Debug, Default)]
    pub struct Timeseries {
        #[csv = "timestamp"]
        pub time_stamp: String,
        pub symbol: String,
        #[csv = "open"]
        pub open: f64,
        #[csv = "high"]
        pub high: f64,
        #[csv = "low"]
        pub low: f64,
        #[csv = "close"]
        pub close: f64,
        #[csv = "adjusted_close"]
        pub adjusted_close: f64,
        #[csv = "volume"]
        pub volume: i64,
    }
}

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    // ─── 2) configure ────────────────────────────────────────────────
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "testdata/withheader.csv".to_string());
    let config = match env::var("CSVSTREAM_CONFIG") {
        Ok(cfg_path) => DecoderConfig::from_yaml_file(&cfg_path)?,
        Err(_) => DecoderConfig::default(),
    };
    info!(path = %path, delimiter = %config.delimiter, has_header = config.has_header, "decoding");

    // ─── 3) stream rows ──────────────────────────────────────────────
    let start = Instant::now();
    let file = File::open(&path).with_context(|| format!("opening `{}`", path))?;
    let records = Decoder::<_, Timeseries>::new(file)?.config(config).unmarshal()?;

    let mut count = 0u64;
    for row in records {
        println!("{:?}", row);
        count += 1;
    }

    info!(rows = count, elapsed = ?start.elapsed(), "done");
    Ok(())
}
