//! `armsight-cli` – ArmSight Command Line Interface
//!
//! This binary drives the full perception-to-motion stack from a terminal.
//! It:
//!
//! 1. Initialises tracing (see `armsight_runtime::telemetry`).
//! 2. Loads `~/.armsight/config.toml`, writing defaults on first run after
//!    asking for the arm's serial port.
//! 3. Assembles the Frame Bus, Spatial Localizer, and Motion Sequencer over
//!    the simulated tabletop rig.
//! 4. Drops the user into an **interactive REPL** whose commands call the
//!    same tools an agent would.
//! 5. Intercepts **Ctrl-C**, then stops the camera and releases the arm.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use armsight_hal::sim::SimRig;
use armsight_runtime::{Toolbox, init_tracing};

fn main() {
    let _telemetry = init_tracing("armsight");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Stack ─────────────────────────────────────────────────────────────
    let rig = SimRig::demo();
    let toolbox = Toolbox::simulated(&rig, &cfg.stack());
    println!(
        "  Simulated rig ready: {} object(s) on the table, arm on {}",
        rig.scene.blocks.len(),
        cfg.robot.port.bold()
    );
    for block in &rig.scene.blocks {
        println!("    • {}", block.label.bold());
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(shutdown, &runtime, &toolbox);

    // ── Teardown ──────────────────────────────────────────────────────────
    runtime.block_on(async {
        toolbox.bus().stop().await;
        if let Err(e) = toolbox.motion().disconnect().await {
            warn!(error = %e, "arm did not close cleanly");
        }
    });
    info!("armsight exited");
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      ArmSight First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ArmSight.\n");

    let mut cfg = config::Config::default();

    cfg.robot.port = prompt_line(&format!("  Arm serial port [{}]: ", cfg.robot.port), &cfg.robot.port);

    let offset = prompt_line(
        &format!("  Gripper offset in mm [{}]: ", cfg.robot.grip_offset_mm),
        &cfg.robot.grip_offset_mm.to_string(),
    );
    match offset.trim().parse::<f32>() {
        Ok(mm) if mm.is_finite() => cfg.robot.grip_offset_mm = mm,
        _ => println!("  {} '{}' is not a number, keeping {}", "Warning:".yellow(), offset, cfg.robot.grip_offset_mm),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    _                 ____  _       _     _   "#.bold().cyan());
    println!("{}", r#"   / \   _ __ _ __ __/ ___|(_) __ _| |__ | |_ "#.bold().cyan());
    println!("{}", r#"  / _ \ | '__| '_ ` _ \___ \| |/ _` | '_ \| __|"#.bold().cyan());
    println!("{}", r#" / ___ \| |  | | | | |___) | | (_| | | | | |_ "#.bold().cyan());
    println!("{}", r#"/_/   \_\_|  |_| |_| |____/|_|\__, |_| |_|\__|"#.bold().cyan());
    println!("{}", r#"                              |___/           "#.bold().cyan());
    println!();
    println!("  {} {}", "ArmSight".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Depth-camera guided pick and place");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
