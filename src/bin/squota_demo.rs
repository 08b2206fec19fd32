// src/bin/squota_demo.rs
use std::env;
use std::process;

use anyhow::Result;
use colored::*;
use squota::demo::{run_demo, DemoReport};
use squota::{render, render_list, DemoConfig, IoctlBackend};

fn main() -> Result<()> {
    squota::logging::init()?;

    // 1. Rutas desde los argumentos, límite opcional desde el entorno
    let cfg = DemoConfig::from_args(env::args_os().skip(1))?
        .with_limit_var(env::var(DemoConfig::LIMIT_ENV))?;

    // 2. Correr el flujo contra el kernel
    let backend = IoctlBackend::new();
    match run_demo(&backend, &cfg) {
        Ok(report) => {
            if !print_report(&report) {
                process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {} (errno {})", "✗".red(), e, e.errno());
            process::exit(1);
        }
    }
}

/// Devuelve `false` si el listado muestra algo inesperado.
fn print_report(report: &DemoReport) -> bool {
    println!("\n{}", " JERARQUÍA DE QGROUPS ".on_blue().bold());
    print!("{}", render(&report.hierarchy));

    for (level, groups) in &report.levels {
        let title = match level {
            Some(l) => format!("Nivel {l}"),
            None => "Todos los niveles".to_string(),
        };
        println!("\n{}", title.bold().underline());

        if groups.is_empty() {
            println!("  {} sin qgroups", "•".yellow());
        } else {
            print!("{}", render_list(groups));
        }
    }

    // El demo nunca crea grupos de nivel 3.
    let stray = report
        .levels
        .iter()
        .find(|(level, groups)| *level == Some(3) && !groups.is_empty());
    if stray.is_some() {
        println!("\n{} la búsqueda de 3/X encontró algo", "✗".red());
        return false;
    }

    println!("\n{} Demo completado.\n", "✓ OK".green().bold());
    true
}
