use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, bail};
use clap::Parser;
use live_previews::common::config::{Config, ConfigCommand, config_file};
use live_previews::common::log;
use live_previews::ipc::{MethodRegistry, Request, Response, json_get_uint64};
use live_previews::plugin::LivePreviewsPlugin;
use live_previews::preview::PREVIEW_OUTPUT_NAME;
use live_previews::sys::geometry::{Rect, Size};
use live_previews::sys::host::{Outputs, ViewId};
use live_previews::sys::soft::{Paint, SoftHost};
use tracing::{debug, info, warn};

/// Streams scaled window previews into a headless output on a software
/// compositor. Requests are read from stdin as one JSON object per line.
#[derive(Parser)]
struct Cli {
    /// Path to configuration file to use (overrides default).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Check the configuration file and exit.
    #[arg(long)]
    validate: bool,

    /// Add a demo window of the given size. Windows get ids 1, 2, ... in
    /// order.
    #[arg(long = "view", value_name = "WxH", value_parser = parse_size)]
    views: Vec<Size>,

    /// Frames rendered after each request.
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Write the preview output as a PNG before exiting.
    #[arg(long, value_name = "PATH")]
    dump: Option<PathBuf>,
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (w, h) = s.split_once('x').ok_or_else(|| format!("expected WxH, got {s:?}"))?;
    let width: i32 = w.trim().parse().map_err(|e| format!("bad width {w:?}: {e}"))?;
    let height: i32 = h.trim().parse().map_err(|e| format!("bad height {h:?}: {e}"))?;
    if width <= 0 || height <= 0 {
        return Err(format!("size must be positive, got {s}"));
    }
    Ok(Size::new(width, height))
}

const PALETTE: &[([u8; 4], [u8; 4])] = &[
    ([230, 60, 40, 255], [250, 200, 40, 255]),
    ([30, 120, 220, 255], [40, 220, 180, 255]),
    ([140, 60, 200, 255], [240, 90, 160, 255]),
];

fn main() {
    sigpipe::reset();
    let opt = Cli::parse();
    log::init_logging();

    let config_path = opt.config.clone().unwrap_or_else(config_file);

    if opt.validate {
        let config = match Config::read(&config_path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}: {err:#}", config_path.display());
                process::exit(1);
            }
        };
        let issues = config.validate();
        if issues.is_empty() {
            println!("Config validation passed");
        } else {
            for issue in issues {
                eprintln!("{}", issue);
            }
            process::exit(1);
        }
        return;
    }

    let config = match Config::read_or_default(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {err:#}", config_path.display());
            process::exit(1);
        }
    };
    for issue in config.validate() {
        warn!("config: {issue}");
    }

    if let Err(err) = run(&opt, config) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}

fn run(opt: &Cli, config: Config) -> anyhow::Result<()> {
    let mut host = SoftHost::new();
    host.add_physical_output("DP-1", Size::new(1920, 1080));
    let mut x = 0;
    for (i, size) in opt.views.iter().enumerate() {
        let (from, to) = PALETTE[i % PALETTE.len()];
        let id = ViewId::new(i as u64 + 1);
        host.add_view(id, Rect::new(x, 40, size.width, size.height), Paint::HorizontalGradient {
            from,
            to,
        });
        debug!(view = %id, %size, "demo view added");
        x += size.width;
    }

    let mut registry = MethodRegistry::new();
    let mut plugin = LivePreviewsPlugin::init(&mut host, &mut registry, config);

    let mut stdout = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&mut host, &registry, &mut plugin, &request),
            Err(err) => Response::error(format!("invalid request: {err}")),
        };
        for _ in 0..opt.frames {
            host.dispatch_idle();
            host.render_scheduled();
        }
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    let dumped = match &opt.dump {
        Some(path) => dump_preview(&host, path),
        None => Ok(()),
    };
    plugin.fini(&mut host, &mut registry);
    dumped
}

/// Demo-only methods act on the software host itself; everything else goes
/// through the registry like it would from a real client.
fn dispatch(
    host: &mut SoftHost,
    registry: &MethodRegistry,
    plugin: &mut LivePreviewsPlugin,
    request: &Request,
) -> Response {
    match request.method.as_str() {
        "demo/unmap_view" => {
            let Some(id) = json_get_uint64(&request.data, "id") else {
                return Response::error("missing or invalid id");
            };
            if host.unmap_view(ViewId::new(id)) {
                Response::ok()
            } else {
                Response::error("no such view")
            }
        }
        "demo/suspend" => {
            host.suspend_session();
            Response::ok()
        }
        "demo/status" => match serde_json::to_value(plugin.state(&*host)) {
            Ok(data) => Response::success(data),
            Err(err) => Response::error(err.to_string()),
        },
        "demo/config" => {
            let command = match serde_json::from_value::<ConfigCommand>(request.data.clone()) {
                Ok(command) => command,
                Err(err) => return Response::error(format!("invalid config command: {err}")),
            };
            if let Err(err) = plugin.apply_config(&command) {
                return Response::error(err.to_string());
            }
            match serde_json::to_value(plugin.config().settings) {
                Ok(data) => Response::success(data),
                Err(err) => Response::error(err.to_string()),
            }
        }
        _ => registry.handle_request(host, request),
    }
}

fn dump_preview(host: &SoftHost, path: &Path) -> anyhow::Result<()> {
    let Some(output) = host.output_by_name(PREVIEW_OUTPUT_NAME) else {
        bail!("no preview output to dump");
    };
    let buffer = host.output_buffer(output).context("preview output has no buffer")?;
    let size = buffer.size();
    let image =
        image::RgbaImage::from_raw(size.width as u32, size.height as u32, buffer.pixels().to_vec())
            .context("preview buffer does not match its mode")?;
    image.save(path).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), %size, "preview written");
    Ok(())
}
