//! CLI client for the `minillmd` daemon.
//!
//! Examples:
//!   minillm-cli status
//!   minillm-cli presets
//!   minillm-cli train <config-id> 20
//!   minillm-cli watch <config-id>
//!   minillm-cli generate <config-id> "2+3="
//!   minillm-cli render-weights <config-id> weights.ppm
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use minillm::introspect::WeightMatrixInfo;
use minillm::trainer::TrainingEvent;
use minillm::viz::{
    render_matrix, truncation_notice, AttentionResult, Matrix, Raster, RenderOptions,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1:9877";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    ConfigList,
    ConfigPresets,
    ActiveModels,
    TrainingStart {
        config_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_epochs: Option<usize>,
        continue_training: bool,
    },
    TrainingStop {
        config_id: Option<String>,
    },
    TrainingPause {
        config_id: Option<String>,
    },
    TrainingResume {
        config_id: Option<String>,
    },
    Generate {
        config_id: Option<String>,
        prompt: String,
    },
    Subscribe {
        config_id: Option<String>,
    },
    EvalWeightMatrices {
        config_id: Option<String>,
    },
    EvalAttention {
        config_id: Option<String>,
        text: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEntry {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    is_preset: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelEntry {
    config_id: String,
    status: String,
    is_active: bool,
    in_memory: bool,
    total_parameters: usize,
    last_loss: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    Configs {
        configs: Vec<ConfigEntry>,
    },
    ActiveModels {
        models: Vec<ModelEntry>,
    },
    TrainingStarted {
        run_id: String,
        total_epochs: usize,
        vocab_size: usize,
        total_parameters: usize,
    },
    Generated {
        generated_text: String,
    },
    Subscribed {
        config_id: Option<String>,
    },
    WeightMatrices {
        matrices: Vec<WeightMatrixInfo>,
    },
    Attention {
        attention: Vec<AttentionResult>,
    },
    Success {
        message: String,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamedEvent {
    config_id: String,
    #[serde(flatten)]
    event: TrainingEvent,
}

fn usage() -> ! {
    eprintln!("minillm-cli (talks to minillmd @ {DEFAULT_ADDR} by default)");
    eprintln!("Usage: minillm-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                          Loaded models and what they are doing");
    eprintln!("  configs | presets               List model configs");
    eprintln!("  train <config> [epochs] [--continue]  Start a training run");
    eprintln!("  stop | pause | resume [config]  Control a training run");
    eprintln!("  generate <config> <prompt>      Sample a completion");
    eprintln!("  watch [config]                  Stream training events until interrupted");
    eprintln!("  render-weights <config> <out.ppm> [param]");
    eprintln!("                                  Draw a weight matrix as a dot grid");
    eprintln!("  render-attention <config> <text> <out.ppm> [layer] [head]");
    eprintln!("                                  Draw an attention pattern as a dot grid");
    eprintln!("  shutdown                        Stop training, save and exit the daemon");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = std::env::var("MINILLMD_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn connect(
    addr: &str,
    req: &Request,
    timeout: Option<Duration>,
) -> Result<(TcpStream, BufReader<TcpStream>), String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(timeout)
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;
    Ok((stream, reader))
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    // Generation and attention run a forward pass; allow them time.
    let (_stream, mut reader) = connect(addr, req, Some(Duration::from_secs(60)))?;
    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn watch(addr: &str, config_id: Option<String>) -> Result<(), String> {
    let (_stream, reader) = connect(addr, &Request::Subscribe { config_id }, None)?;
    for line in reader.lines() {
        let line = line.map_err(|e| format!("recv: {e}"))?;
        if let Ok(Response::Subscribed { config_id }) = serde_json::from_str::<Response>(&line) {
            println!("watching {}", config_id.as_deref().unwrap_or("all models"));
            continue;
        }
        let ev: StreamedEvent =
            serde_json::from_str(&line).map_err(|e| format!("parse event: {e}"))?;
        match ev.event {
            TrainingEvent::StatusChange { status, message } => match message {
                Some(m) => println!("[{}] status={status:?} ({m})", ev.config_id),
                None => println!("[{}] status={status:?}", ev.config_id),
            },
            TrainingEvent::BatchComplete {
                epoch,
                batch,
                total_batches,
                batch_loss,
            } => println!(
                "[{}] epoch {epoch} batch {batch}/{total_batches} loss={batch_loss:.4}",
                ev.config_id
            ),
            TrainingEvent::EpochComplete {
                epoch,
                total_epochs,
                loss,
                elapsed_seconds,
                weight_snapshot,
                ..
            } => println!(
                "[{}] epoch {epoch}/{total_epochs} loss={loss:.4} elapsed={elapsed_seconds:.1}s{}",
                ev.config_id,
                if weight_snapshot.is_some() { " +snapshot" } else { "" }
            ),
        }
    }
    Ok(())
}

fn write_ppm(m: &Matrix, path: &str) -> Result<(), String> {
    let opts = RenderOptions::default();
    let mut raster = Raster::new(0, 0);
    render_matrix(&mut raster, m, &opts);
    if let Some(note) = truncation_notice(m, &opts) {
        println!("{note}");
    }
    let file = File::create(path).map_err(|e| format!("create {path}: {e}"))?;
    let mut w = BufWriter::new(file);
    raster
        .write_ppm(&mut w)
        .and_then(|_| w.flush())
        .map_err(|e| format!("write {path}: {e}"))?;
    println!(
        "wrote {path} ({}x{} px, {}x{} matrix)",
        raster.width(),
        raster.height(),
        m.rows,
        m.cols
    );
    Ok(())
}

fn fail(msg: &str) -> ! {
    eprintln!("Failed: {msg}");
    process::exit(1);
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };
    let arg = |i: usize| -> String { args.get(i).cloned().unwrap_or_else(|| usage()) };

    let req = match cmd.as_str() {
        "status" => Request::ActiveModels,
        "configs" => Request::ConfigList,
        "presets" => Request::ConfigPresets,
        "train" => {
            let config_id = arg(1);
            let continue_training = args.iter().any(|a| a == "--continue");
            let num_epochs = args
                .get(2)
                .filter(|a| *a != "--continue")
                .map(|a| {
                    a.parse()
                        .unwrap_or_else(|_| make_error("epochs must be a positive number"))
                });
            Request::TrainingStart {
                config_id,
                num_epochs,
                continue_training,
            }
        }
        "stop" => Request::TrainingStop {
            config_id: args.get(1).cloned(),
        },
        "pause" => Request::TrainingPause {
            config_id: args.get(1).cloned(),
        },
        "resume" => Request::TrainingResume {
            config_id: args.get(1).cloned(),
        },
        "generate" => Request::Generate {
            config_id: Some(arg(1)),
            prompt: arg(2),
        },
        "watch" => {
            if let Err(e) = watch(&addr, args.get(1).cloned()) {
                fail(&e);
            }
            process::exit(0);
        }
        "render-weights" => Request::EvalWeightMatrices {
            config_id: Some(arg(1)),
        },
        "render-attention" => Request::EvalAttention {
            config_id: Some(arg(1)),
            text: arg(2),
        },
        "shutdown" => Request::Shutdown,
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::Configs { configs }) => {
            for c in configs {
                let tag = if c.is_preset { " [preset]" } else { "" };
                println!("{}  {}{}  {}", c.id, c.name, tag, c.description);
            }
        }
        Ok(Response::ActiveModels { models }) => {
            if models.is_empty() {
                println!("no models loaded or saved");
            }
            for m in models {
                let loss = m
                    .last_loss
                    .map(|l| format!("{l:.4}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}{} status={} params={} last_loss={} {}",
                    if m.is_active { "*" } else { " " },
                    m.config_id,
                    m.status,
                    m.total_parameters,
                    loss,
                    if m.in_memory { "in-memory" } else { "saved" },
                );
            }
        }
        Ok(Response::TrainingStarted {
            run_id,
            total_epochs,
            vocab_size,
            total_parameters,
        }) => println!(
            "run {run_id}: {total_epochs} epochs, vocab={vocab_size}, params={total_parameters}"
        ),
        Ok(Response::Generated { generated_text }) => println!("{generated_text}"),
        Ok(Response::WeightMatrices { matrices }) => {
            let wanted = args.get(3);
            let chosen = match wanted {
                Some(name) => matrices
                    .iter()
                    .find(|m| &format!("{}.{}", m.module, m.param) == name || &m.param == name),
                None => matrices.first(),
            };
            let Some(info) = chosen else {
                make_error("no such weight matrix");
            };
            println!(
                "{}.{} shape={:?} mean={:.4} std={:.4}",
                info.module, info.param, info.shape, info.mean, info.std
            );
            if let Err(e) = write_ppm(&info.matrix, &arg(2)) {
                fail(&e);
            }
        }
        Ok(Response::Attention { attention }) => {
            let layer: usize = args.get(4).map_or(0, |a| {
                a.parse().unwrap_or_else(|_| make_error("layer must be a number"))
            });
            let head: usize = args.get(5).map_or(0, |a| {
                a.parse().unwrap_or_else(|_| make_error("head must be a number"))
            });
            let Some(a) = attention.iter().find(|a| a.layer == layer && a.head == head) else {
                make_error("no attention for that layer/head");
            };
            println!("layer {} head {}: {}", a.layer, a.head, a.tokens.join(" "));
            if let Err(e) = write_ppm(&a.weights, &arg(3)) {
                fail(&e);
            }
        }
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Subscribed { .. }) | Ok(Response::Other) => {
            println!("unexpected response from daemon");
        }
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => fail(&e),
    }
}
