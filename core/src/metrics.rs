//! Prometheus text renderer for per-sandbox statistics.

use std::fmt::Write as _;

use crate::supervisor::Supervisor;

const LE_LABELS: [&str; 5] = ["0.5", "1", "5", "10", "+Inf"];

/// Render stats for every active sandbox in the Prometheus text exposition
/// format.
pub fn export(supervisor: &Supervisor) -> String {
    let active = supervisor.list_active();
    let mut names: Vec<&String> = active.keys().collect();
    names.sort();

    let mut out = String::new();
    let mut described: Vec<&str> = Vec::new();

    for name in names {
        let Some(handle) = active.get(name) else {
            continue;
        };
        let stats = handle.stats();
        let label = escape_label(name);
        emit(
            &mut out,
            &mut described,
            "warden_cpu_ms",
            "CPU time consumed by sandbox in milliseconds",
            "gauge",
            format!("warden_cpu_ms{{sandbox=\"{label}\"}} {:.0}", stats.cpu_ms),
        );
        emit(
            &mut out,
            &mut described,
            "warden_mem_bytes",
            "Peak memory used by sandbox in bytes",
            "gauge",
            format!("warden_mem_bytes{{sandbox=\"{label}\"}} {}", stats.peak_mem_bytes),
        );
        emit(
            &mut out,
            &mut described,
            "warden_errors_total",
            "Total errors encountered by sandbox",
            "counter",
            format!("warden_errors_total{{sandbox=\"{label}\"}} {}", stats.errors),
        );
        emit(
            &mut out,
            &mut described,
            "warden_cost",
            "Internal cost score for sandbox",
            "gauge",
            format!("warden_cost{{sandbox=\"{label}\"}} {:.6}", stats.cost()),
        );

        let mut cumulative = 0u64;
        for (bucket, le) in stats.latency_buckets.iter().zip(LE_LABELS) {
            cumulative += bucket;
            emit(
                &mut out,
                &mut described,
                "warden_latency_ms",
                "Sandbox operation latency in milliseconds",
                "histogram",
                format!("warden_latency_ms_bucket{{sandbox=\"{label}\",le=\"{le}\"}} {cumulative}"),
            );
        }
        emit(
            &mut out,
            &mut described,
            "warden_latency_ms",
            "Sandbox operation latency in milliseconds",
            "histogram",
            format!("warden_latency_ms_count{{sandbox=\"{label}\"}} {}", stats.operations),
        );
        emit(
            &mut out,
            &mut described,
            "warden_latency_ms",
            "Sandbox operation latency in milliseconds",
            "histogram",
            format!("warden_latency_ms_sum{{sandbox=\"{label}\"}} {:.3}", stats.latency_sum_ms),
        );
    }
    out
}

fn emit(
    out: &mut String,
    described: &mut Vec<&str>,
    name: &'static str,
    help: &str,
    typ: &str,
    sample: String,
) {
    if !described.contains(&name) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {typ}");
        described.push(name);
    }
    out.push_str(&sample);
    out.push('\n');
}

/// Escape a label value per the Prometheus text exposition format.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
