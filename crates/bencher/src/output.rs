use std::io::Write;

use serde::Serialize;

use crate::options::BenchConfig;

/// One recorded latency sample, in reply-arrival order.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub index: usize,
    pub latency_us: i64,
}

/// Append every sample to the CSV writer, before the report sorts them.
pub fn write_samples<W: Write>(
    writer: &mut csv::Writer<W>,
    latencies: &[i64],
) -> anyhow::Result<()> {
    for (index, &latency_us) in latencies.iter().enumerate() {
        writer.serialize(Sample { index, latency_us })?;
    }
    writer.flush()?;
    Ok(())
}

/// Print the closing report for one benchmark pass. Sorts the samples in
/// place.
///
/// The requests-per-second figure divides by the sum of the per-request
/// latencies rather than the wall clock, which would also count setup work
/// such as buffer assembly and key randomization.
pub fn print_report(
    out: &mut impl Write,
    cfg: &BenchConfig,
    title: &str,
    latencies: &mut [i64],
) -> std::io::Result<()> {
    let finished = latencies.len();
    latencies.sort_unstable();
    let total_us: i64 = latencies.iter().sum();
    let rps = if total_us > 0 {
        finished as f64 / (total_us as f64 / 1e6)
    } else {
        0.0
    };

    if cfg.csv {
        writeln!(out, "\"{title}\",\"{rps:.2}\"")?;
    } else if cfg.quiet {
        writeln!(out, "{title}: {rps:.2} requests per second")?;
    } else {
        writeln!(out, "====== {title} ======")?;
        let threshold_us = cfg.max_latency_ms as i64 * 1000;
        let mut boundary_ms = 0;
        let mut beyond = 0usize;
        for (i, &latency) in latencies.iter().enumerate() {
            if latency / 1000 != boundary_ms || i == finished - 1 {
                boundary_ms = latency / 1000;
                let percentile = (i + 1) as f64 * 100.0 / finished as f64;
                writeln!(out, "{percentile:.2}% <= {boundary_ms} milliseconds")?;
            }
            if latency > threshold_us {
                beyond += 1;
            }
        }
        writeln!(out, "{} requests latency > {} milliseconds", beyond, cfg.max_latency_ms)?;
        writeln!(out)?;
        writeln!(out, "  {} parallel clients", cfg.numclients)?;
        writeln!(out, "  {} bytes payload", cfg.datasize)?;
        writeln!(out, "  keep alive: {}", u8::from(cfg.keepalive))?;
        writeln!(
            out,
            "  {} requests completed in {:.2} seconds",
            finished,
            total_us as f64 / 1e6
        )?;
        writeln!(out, "  {rps:.2} requests per second")?;
        writeln!(out)?;
    }
    Ok(())
}
