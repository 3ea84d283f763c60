use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use dbgcache::logging::{init_json_logging, init_logging};
use dbgcache::metrics;

#[derive(Debug, Default)]
pub struct Config {
    pub verbose: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub udp_sink: Option<JoinHandle<()>>,
}

pub fn init(cache_config: &dbgcache::config::Config, config: Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.verbose {
        // SAFETY: no other threads are running yet.
        unsafe { init_logging(cache_config) };
    } else {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        init_json_logging("INFO", || NoopWriter);
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(std::thread::spawn(move || {
            let mut buf = [0; 1024];
            while listener.recv(&mut buf).is_ok() {}
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd(&cache_config.metrics.prefix, host, tags)?;
    }

    Ok(guard)
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
