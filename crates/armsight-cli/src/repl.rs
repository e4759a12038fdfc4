//! REPL – Read-Eval-Print Loop for the ArmSight interactive shell.
//!
//! Every tool command maps onto one [`Toolbox`] tool; the reply is printed
//! exactly as an agent would receive it.
//!
//! | Command | Tool |
//! |---|---|
//! | `/camera` | `show_camera` |
//! | `/locate <description>` | `locate` |
//! | `/pick <description>` or `/pick <x> <y> <z>` | `pick_up` |
//! | `/place <description>` or `/place <x> <y> <z>` | `place` |
//! | `/grip`, `/release` | `close_gripper`, `open_gripper` |
//! | `/home`, `/pose` | `go_home`, `get_pose` |
//! | `/affine <9 values>` | `set_affine_matrix` |
//! | `/above <u> <v> [z]`, `/block <u> <v> [z]` | `move_above_pixel`, `move_to_block_pixel` |
//! | `/call <tool> <json>` | any tool with raw JSON arguments |
//!
//! `/image <id> <file>` writes a stored result image as JPEG, `/tools` lists
//! the tool declarations, `/quit` or `/exit` leaves.

use colored::Colorize;
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;

use armsight_runtime::{Toolbox, tool_declarations};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Tools,
    Quit,
    Tool { name: String, args: Value },
    SaveImage { id: String, path: PathBuf },
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>, runtime: &Runtime, toolbox: &Toolbox) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "armsight>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Tools) => cmd_tools(),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Command::Tool { name, args }) => {
                let reply = runtime.block_on(toolbox.dispatch(&name, args));
                print_reply(&reply);
            }
            Ok(Command::SaveImage { id, path }) => cmd_save_image(toolbox, &id, &path),
            Err(msg) => println!("{} {}. Type {} for available commands.", "✗".red(), msg, "/help".bold()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one line of input.
///
/// # Errors
///
/// Returns a short description of what was wrong with the line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let tool = |name: &str, args: Value| {
        Ok(Command::Tool {
            name: name.to_string(),
            args,
        })
    };

    match head {
        "/help" => Ok(Command::Help),
        "/tools" => Ok(Command::Tools),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/camera" => tool("show_camera", json!({})),
        "/grip" => tool("close_gripper", json!({})),
        "/release" => tool("open_gripper", json!({})),
        "/home" => tool("go_home", json!({})),
        "/pose" => tool("get_pose", json!({})),
        "/locate" => {
            if rest.is_empty() {
                return Err("usage: /locate <description>".into());
            }
            tool("locate", json!({ "description": rest }))
        }
        "/pick" => tool("pick_up", target_args(rest, "/pick")?),
        "/place" => tool("place", target_args(rest, "/place")?),
        "/affine" => {
            let values = numbers(rest)?;
            if values.len() != 9 {
                return Err(format!("/affine needs 9 values, got {}", values.len()));
            }
            tool("set_affine_matrix", json!({ "matrix": values }))
        }
        "/above" => tool("move_above_pixel", pixel_args(rest, "/above")?),
        "/block" => tool("move_to_block_pixel", pixel_args(rest, "/block")?),
        "/call" => {
            let (name, raw) = match rest.split_once(char::is_whitespace) {
                Some((name, raw)) => (name, raw.trim()),
                None => (rest, ""),
            };
            if name.is_empty() {
                return Err("usage: /call <tool> [json]".into());
            }
            let args = if raw.is_empty() {
                json!({})
            } else {
                serde_json::from_str(raw).map_err(|e| format!("bad JSON arguments: {e}"))?
            };
            tool(name, args)
        }
        "/image" => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(path), None) => Ok(Command::SaveImage {
                    id: id.to_string(),
                    path: PathBuf::from(path),
                }),
                _ => Err("usage: /image <id> <file>".into()),
            }
        }
        other => Err(format!("Unknown command '{other}'")),
    }
}

fn numbers(raw: &str) -> Result<Vec<f64>, String> {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|_| format!("'{s}' is not a number")))
        .collect()
}

/// Three numbers are camera-frame coordinates; anything else is a
/// description.
fn target_args(rest: &str, usage: &str) -> Result<Value, String> {
    if rest.is_empty() {
        return Err(format!("usage: {usage} <description> | {usage} <x> <y> <z>"));
    }
    match numbers(rest) {
        Ok(v) if v.len() == 3 => Ok(json!({ "x": v[0], "y": v[1], "z": v[2] })),
        _ => Ok(json!({ "description": rest })),
    }
}

fn pixel_args(rest: &str, usage: &str) -> Result<Value, String> {
    let v = numbers(rest)?;
    match v.as_slice() {
        [u, v] => Ok(json!({ "u": u, "v": v })),
        [u, v, z] => Ok(json!({ "u": u, "v": v, "z": z })),
        _ => Err(format!("usage: {usage} <u> <v> [z]")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn print_reply(reply: &str) {
    if reply.starts_with("Error:") {
        println!("{}", reply.red());
    } else {
        println!("{reply}");
    }
}

fn cmd_help() {
    println!();
    println!("{}", "ArmSight Commands".bold().underline());
    println!("  {}                      – start the camera", "/camera".bold().cyan());
    println!("  {}        – find an object and report its position", "/locate <what>".bold().cyan());
    println!("  {}  – pick up by description or coordinates", "/pick <what | x y z>".bold().cyan());
    println!("  {} – put down at a description or coordinates", "/place <what | x y z>".bold().cyan());
    println!("  {}  – suction on / off", "/grip  /release".bold().cyan());
    println!("  {}     – home the arm / read its pose", "/home  /pose".bold().cyan());
    println!("  {}        – set the pixel → robot matrix", "/affine <9 values>".bold().cyan());
    println!("  {} – move over / onto a pixel", "/above  /block <u> <v> [z]".bold().cyan());
    println!("  {}      – save a result image as JPEG", "/image <id> <file>".bold().cyan());
    println!("  {}      – run any tool with JSON arguments", "/call <tool> <json>".bold().cyan());
    println!("  {}                       – list tool declarations", "/tools".bold().cyan());
    println!("  {}                – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_tools() {
    println!("{}", "Tools".bold().underline());
    for decl in tool_declarations() {
        println!("  {} – {}", decl.name.bold().cyan(), decl.description);
    }
}

fn cmd_save_image(toolbox: &Toolbox, id: &str, path: &Path) {
    match toolbox.image(id) {
        Ok(jpeg) => match std::fs::write(path, &jpeg) {
            Ok(()) => println!(
                "{} {} ({} bytes)",
                "✓ Saved".green(),
                path.display().to_string().bold(),
                jpeg.len()
            ),
            Err(e) => println!("{}: {}", "Error writing image".red(), e),
        },
        Err(e) => println!("{}", format!("Error: {e}").red()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, args: Value) -> Command {
        Command::Tool {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("  /exit "), Ok(Command::Quit));
        assert_eq!(parse_command("/home"), Ok(tool("go_home", json!({}))));
        assert_eq!(parse_command("/grip"), Ok(tool("close_gripper", json!({}))));
        assert_eq!(parse_command("/camera"), Ok(tool("show_camera", json!({}))));
    }

    #[test]
    fn locate_keeps_the_whole_description() {
        assert_eq!(
            parse_command("/locate the   red block"),
            Ok(tool("locate", json!({"description": "the   red block"})))
        );
        assert!(parse_command("/locate").is_err());
    }

    #[test]
    fn pick_accepts_coordinates_or_description() {
        assert_eq!(
            parse_command("/pick 10 -5 320.5"),
            Ok(tool("pick_up", json!({"x": 10.0, "y": -5.0, "z": 320.5})))
        );
        assert_eq!(
            parse_command("/place blue cup"),
            Ok(tool("place", json!({"description": "blue cup"})))
        );
        // Two numbers are not a point.
        assert_eq!(
            parse_command("/pick 3 4"),
            Ok(tool("pick_up", json!({"description": "3 4"})))
        );
    }

    #[test]
    fn affine_needs_nine_values() {
        let ok = parse_command("/affine 1,0,0 0,1,0 0,0,1");
        assert_eq!(
            ok,
            Ok(tool(
                "set_affine_matrix",
                json!({"matrix": [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]})
            ))
        );
        assert!(parse_command("/affine 1 2 3").is_err());
        assert!(parse_command("/affine 1 2 3 4 5 6 7 8 x").is_err());
    }

    #[test]
    fn pixel_moves_take_optional_z() {
        assert_eq!(
            parse_command("/above 100 200"),
            Ok(tool("move_above_pixel", json!({"u": 100.0, "v": 200.0})))
        );
        assert_eq!(
            parse_command("/block 100 200 -45"),
            Ok(tool("move_to_block_pixel", json!({"u": 100.0, "v": 200.0, "z": -45.0})))
        );
        assert!(parse_command("/above 1").is_err());
    }

    #[test]
    fn call_passes_raw_json() {
        assert_eq!(
            parse_command(r#"/call locate {"description": "can"}"#),
            Ok(tool("locate", json!({"description": "can"})))
        );
        assert_eq!(parse_command("/call get_pose"), Ok(tool("get_pose", json!({}))));
        assert!(parse_command("/call locate {oops").is_err());
    }

    #[test]
    fn image_needs_id_and_path() {
        assert_eq!(
            parse_command("/image abc out.jpg"),
            Ok(Command::SaveImage {
                id: "abc".into(),
                path: PathBuf::from("out.jpg")
            })
        );
        assert!(parse_command("/image abc").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(parse_command("/dance").is_err());
        assert!(parse_command("hello").is_err());
    }
}
