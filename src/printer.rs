// src/printer.rs
use std::fmt::Write;

use crate::qgroup::{Direction, Qgroup};

/// Texto indentado de `qg` y de la rama de relaciones que tenga cargada.
pub fn render(qg: &Qgroup) -> String {
    let mut out = String::new();
    render_node(&mut out, qg, 0);
    out
}

fn render_node(out: &mut String, qg: &Qgroup, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
    out.push_str(&node_line(qg));
    out.push('\n');

    // Un recorrido solo llena uno de los dos lados.
    let next = if qg.parents.is_empty() {
        qg.relations(Direction::Down)
    } else {
        qg.relations(Direction::Up)
    };
    for rel in next {
        render_node(out, rel, depth + 1);
    }
}

fn node_line(qg: &Qgroup) -> String {
    format!(
        "qgroup {}/{} used {} limit {}",
        qg.id.level(),
        qg.id.subvol(),
        qg.used,
        limit_text(qg.limit)
    )
}

fn limit_text(limit: u64) -> String {
    if limit == 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}

/// Tabla simple para listados por nivel.
pub fn render_list(groups: &[Qgroup]) -> String {
    let mut out = String::new();
    for qg in groups {
        let limit = if qg.limit == 0 {
            "unlimited".to_string()
        } else {
            format_size(qg.limit)
        };
        let _ = writeln!(
            out,
            "{:<16} {:>12} {:>12}",
            qg.id.to_string(),
            format_size(qg.used),
            limit
        );
    }
    out
}

/// Tamaño legible: B, K, M, G o T con dos decimales.
pub fn format_size(bytes: u64) -> String {
    const K: u64 = 1 << 10;
    const M: u64 = 1 << 20;
    const G: u64 = 1 << 30;
    const T: u64 = 1 << 40;

    let b = bytes as f64;
    match bytes {
        n if n < K => format!("{n}B"),
        n if n < M => format!("{:.2}K", b / K as f64),
        n if n < G => format!("{:.2}M", b / M as f64),
        n if n < T => format!("{:.2}G", b / G as f64),
        _ => format!("{:.2}T", b / T as f64),
    }
}
