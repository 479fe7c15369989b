use crate::config::Config;
use crate::scene;
use crate::world::World;
use anyhow::{bail, Result};

/// The console command protocol: commands are named string-lists, the
/// front-end (TUI, stdin, whatever) is not part of the engine. `execute`
/// takes one line and returns the printable result.
pub struct Console {
    commands: Vec<CommandInfo>,
}

struct CommandInfo {
    name: &'static str,
    help: &'static str,
}

pub struct ConsoleContext<'a> {
    pub config: &'a mut Config,
    pub world: &'a mut World,
    pub fps: f32,
}

impl Console {
    pub fn new() -> Console {
        Console {
            commands: vec![
                CommandInfo {
                    name: "info",
                    help: "info <cmd> - describe a command",
                },
                CommandInfo {
                    name: "FPS",
                    help: "FPS - print frames per second",
                },
                CommandInfo {
                    name: "get",
                    help: "get <var> - print a config variable",
                },
                CommandInfo {
                    name: "set",
                    help: "set <var> <value> - write a config variable",
                },
                CommandInfo {
                    name: "list_vars",
                    help: "list_vars [prefix] - list config variables",
                },
                CommandInfo {
                    name: "save_scene",
                    help: "save_scene <path> - write the scene package",
                },
                CommandInfo {
                    name: "load_scene",
                    help: "load_scene <path> - restore a scene package",
                },
            ],
        }
    }

    pub fn execute(&self, line: &str, ctx: &mut ConsoleContext) -> Result<String> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(String::new());
        };
        let args: Vec<&str> = words.collect();
        match command {
            "info" => {
                let [name] = args[..] else {
                    bail!("usage: info <cmd>");
                };
                match self.commands.iter().find(|info| info.name == name) {
                    Some(info) => Ok(info.help.to_string()),
                    None => bail!("no such command: {name}"),
                }
            }
            "FPS" => Ok(format!("{:.1}", ctx.fps)),
            "get" => {
                let [key] = args[..] else {
                    bail!("usage: get <var>");
                };
                match ctx.config.get(key) {
                    Some(var) => Ok(format!("{var}")),
                    None => bail!("no such variable: {key}"),
                }
            }
            "set" => {
                let [key, value] = args[..] else {
                    bail!("usage: set <var> <value>");
                };
                ctx.config
                    .set(key, value)
                    .map_err(|message| anyhow::anyhow!(message))?;
                Ok(String::new())
            }
            "list_vars" => {
                let prefix = args.first().copied().unwrap_or("");
                Ok(ctx.config.list(prefix))
            }
            "save_scene" => {
                let [path] = args[..] else {
                    bail!("usage: save_scene <path>");
                };
                scene::save_scene(ctx.world, path)?;
                Ok(format!("saved to {path}"))
            }
            "load_scene" => {
                let [path] = args[..] else {
                    bail!("usage: load_scene <path>");
                };
                scene::load_scene(ctx.world, path)?;
                Ok(format!("loaded {path}"))
            }
            unknown => bail!("unknown command: {unknown}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(line: &str) -> Result<String> {
        let console = Console::new();
        let mut config = Config::new();
        let mut world = World::new();
        let mut ctx = ConsoleContext {
            config: &mut config,
            world: &mut world,
            fps: 60.,
        };
        console.execute(line, &mut ctx)
    }

    #[test]
    fn get_and_set_round_trip() {
        let console = Console::new();
        let mut config = Config::new();
        let mut world = World::new();
        let mut ctx = ConsoleContext {
            config: &mut config,
            world: &mut world,
            fps: 0.,
        };
        console
            .execute("set Render.shadow_map_dim 2048", &mut ctx)
            .unwrap();
        let value = console.execute("get Render.shadow_map_dim", &mut ctx).unwrap();
        assert_eq!(value, "2048");
    }

    #[test]
    fn fps_formats_the_counter() {
        assert_eq!(run("FPS").unwrap(), "60.0");
    }

    #[test]
    fn list_vars_honours_prefix() {
        let listing = run("list_vars Camera.").unwrap();
        assert!(listing.contains("Camera.fovy"));
        assert!(!listing.contains("Render."));
    }

    #[test]
    fn info_describes_commands() {
        assert!(run("info get").unwrap().contains("get <var>"));
        assert!(run("info nonsense").is_err());
    }

    #[test]
    fn unknown_commands_are_errors() {
        assert!(run("frobnicate").is_err());
        assert!(run("get No.Such.Var").is_err());
    }
}
