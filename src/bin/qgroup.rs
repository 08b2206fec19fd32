// src/bin/qgroup.rs
use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context, Result};
use colored::*;
use squota::{
    admin, render, render_list, BtrfsBackend, Direction, IoctlBackend, QgroupError, QgroupId,
    QgroupRepository,
};

const USAGE: &str = "Uso: qgroup <montaje> <comando>
  show <nivel/id> [up|down]
  list [nivel]
  create <nivel/id>
  destroy <nivel/id>
  assign <hijo> <padre>
  unassign <hijo> <padre>
  limit <nivel/id> <bytes>
  sync";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Show(QgroupId, Direction),
    List(Option<u16>),
    Create(QgroupId),
    Destroy(QgroupId),
    Assign(QgroupId, QgroupId),
    Unassign(QgroupId, QgroupId),
    Limit(QgroupId, u64),
    Sync,
}

fn parse_id(arg: Option<String>) -> Result<QgroupId> {
    let raw = arg.context(USAGE)?;
    Ok(raw.parse()?)
}

fn parse_command<I: Iterator<Item = String>>(mut args: I) -> Result<Command> {
    let name = args.next().context(USAGE)?;

    let cmd = match name.as_str() {
        "show" => {
            let id = parse_id(args.next())?;
            let direction = match args.next().as_deref() {
                None | Some("down") => Direction::Down,
                Some("up") => Direction::Up,
                Some(other) => return Err(anyhow!("dirección inválida {other:?}; use up o down")),
            };
            Command::Show(id, direction)
        }
        "list" => match args.next() {
            Some(level) => Command::List(Some(
                level
                    .parse()
                    .with_context(|| format!("nivel inválido {level:?}"))?,
            )),
            None => Command::List(None),
        },
        "create" => Command::Create(parse_id(args.next())?),
        "destroy" => Command::Destroy(parse_id(args.next())?),
        "assign" => Command::Assign(parse_id(args.next())?, parse_id(args.next())?),
        "unassign" => Command::Unassign(parse_id(args.next())?, parse_id(args.next())?),
        "limit" => {
            let id = parse_id(args.next())?;
            let bytes = args.next().context(USAGE)?;
            let bytes = bytes
                .parse()
                .with_context(|| format!("límite inválido {bytes:?}"))?;
            Command::Limit(id, bytes)
        }
        "sync" => Command::Sync,
        other => return Err(anyhow!("comando desconocido {other:?}\n{USAGE}")),
    };

    if args.next().is_some() {
        return Err(anyhow!("demasiados argumentos\n{USAGE}"));
    }
    Ok(cmd)
}

fn run<B: BtrfsBackend>(backend: &B, dir: &B::Dir, cmd: Command) -> Result<(), QgroupError> {
    match cmd {
        Command::Show(id, direction) => {
            let qg = QgroupRepository::new(backend, dir).load_hierarchy(id, direction)?;
            print!("{}", render(&qg));
        }
        Command::List(level) => {
            let groups = QgroupRepository::new(backend, dir).list_qgroups(level)?;
            if groups.is_empty() {
                println!("  {} sin qgroups", "•".yellow());
            } else {
                println!("{}", format!("{:<16} {:>12} {:>12}", "qgroup", "usado", "límite").bold());
                print!("{}", render_list(&groups));
            }
        }
        Command::Create(id) => admin::create_qgroup(backend, dir, id)?,
        Command::Destroy(id) => admin::destroy_qgroup(backend, dir, id)?,
        Command::Assign(child, parent) => admin::assign(backend, dir, child, parent)?,
        Command::Unassign(child, parent) => admin::unassign(backend, dir, child, parent)?,
        Command::Limit(id, bytes) => admin::set_limit(backend, dir, id, bytes)?,
        Command::Sync => admin::sync(backend, dir)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    squota::logging::init()?;

    // 1. Leer argumentos: qgroup <montaje> <comando> ...
    let mut args = env::args().skip(1);
    let mount = args.next().map(PathBuf::from).context(USAGE)?;
    let cmd = parse_command(args)?;

    // 2. Abrir el montaje y ejecutar; el directorio se cierra al salir
    let backend = IoctlBackend::new();
    let result = backend
        .open_dir(&mount)
        .and_then(|dir| run(&backend, &dir, cmd));

    if let Err(e) = result {
        eprintln!(
            "{} {}: {} (errno {})",
            "✗".red(),
            mount.display(),
            e,
            e.as_errno()
        );
        process::exit(1);
    }
    Ok(())
}
