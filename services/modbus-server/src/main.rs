//! Modbus Server
//!
//! Serves configured measurements as Modbus coils and holding registers.
//! The input plugin prints client edits as JSON metric lines on stdout; the
//! output plugin reads JSON metric lines from stdin into its register file.

use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::logging::LogConfig;
use common::ServiceArgs;
use modbus_memory::Metric;
use modbus_server::config::DEFAULT_CONFIG_PATH;
use modbus_server::{AgentConfig, ModbusServerInput, ModbusServerOutput};

const SERVICE_NAME: &str = "modbus-server";

/// Print every published metric as one JSON line.
async fn write_metrics(mut metrics: mpsc::UnboundedReceiver<Metric>) {
    let mut stdout = tokio::io::stdout();
    while let Some(metric) = metrics.recv().await {
        let mut line = match serde_json::to_string(&metric) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize metric '{}': {}", metric.name, e);
                continue;
            },
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!("Failed to write metric: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!("Failed to flush stdout: {}", e);
            break;
        }
    }
    debug!("Metric writer stopped");
}

/// Feed JSON metric lines from stdin into the output register file.
async fn read_metrics(output: ModbusServerOutput, cancel: CancellationToken) -> ModbusServerOutput {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Metric>(line) {
                    Ok(metric) => {
                        if let Err(e) = output.write(std::slice::from_ref(&metric)) {
                            warn!("Metric '{}' not written: {}", metric.name, e);
                        }
                    },
                    Err(e) => warn!("Invalid metric line: {}", e),
                }
            },
            Ok(None) => {
                info!("Metric input closed, serving last values");
                cancel.cancelled().await;
                break;
            },
            Err(e) => {
                error!("Failed to read metric input: {}", e);
                cancel.cancelled().await;
                break;
            },
        }
    }
    output
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServiceArgs::parse();
    let config_path = args.config_path(Path::new(DEFAULT_CONFIG_PATH));
    let config = AgentConfig::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let level = args.log_level_or(&config.logging.level).to_string();
    common::logging::init_with_config(&LogConfig {
        service_name: SERVICE_NAME.to_string(),
        level,
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: !args.no_color,
    })?;

    if config.input.is_none() && config.output.is_none() {
        bail!("Neither [input] nor [output] is configured");
    }

    // ============ Phase 1: Validate configuration ============
    let mut input = config.input.clone().map(ModbusServerInput::new);
    let mut output = config.output.clone().map(ModbusServerOutput::new);
    if let Some(input) = input.as_mut() {
        input.init().context("Input plugin")?;
    }
    if let Some(output) = output.as_mut() {
        output.init().context("Output plugin")?;
    }

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_task = common::shutdown::cancel_on_shutdown(cancel.clone());

    // ============ Phase 2: Start servers ============
    let mut writer = None;
    if let Some(input) = input.as_mut() {
        let (tx, rx) = mpsc::unbounded_channel();
        input.start(tx).await.context("Input plugin")?;
        writer = Some(tokio::spawn(write_metrics(rx)));
    }

    let mut reader = None;
    if let Some(mut output) = output.take() {
        output.connect().await.context("Output plugin")?;
        reader = Some(tokio::spawn(read_metrics(output, cancel.clone())));
    }

    info!("{} running", SERVICE_NAME);
    cancel.cancelled().await;

    // ============ Phase 3: Shutdown ============
    if let Some(mut input) = input {
        input.stop().await;
    }
    if let Some(writer) = writer {
        if let Err(e) = writer.await {
            error!("Metric writer failed: {}", e);
        }
    }
    if let Some(reader) = reader {
        match reader.await {
            Ok(mut output) => output.close().await,
            Err(e) => error!("Metric reader failed: {}", e),
        }
    }
    if let Err(e) = signal_task.await {
        error!("Signal handler failed: {}", e);
    }

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
