//! Rendering of analyzer output. Formatting only — every number comes from
//! [`crate::stats`].

use crate::stats::Analysis;

pub fn render_json(analysis: &Analysis) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(analysis)
}

pub fn render_markdown(analysis: &Analysis, run_set_name: &str) -> String {
    let mut out = String::new();
    let pct = |x: f64| format!("{:.0}%", x * 100.0);

    out.push_str(&format!("# Run results: {run_set_name}\n\n"));
    out.push_str(&format!(
        "Confidence level: {:.0}% (Wilson score intervals; Newcombe method for differences)\n\n",
        analysis.confidence * 100.0
    ));

    out.push_str("## Conditions\n\n");
    out.push_str("| Condition | n | Pass | Rate | CI | Errors | Mean time (s) | Mean tokens |\n");
    out.push_str("|-----------|---|------|------|----|--------|---------------|-------------|\n");
    for c in &analysis.conditions {
        out.push_str(&format!(
            "| {} | {} | {} | {} | [{}, {}] | {} | {:.1} | {:.0} |\n",
            c.condition,
            c.n,
            c.successes,
            pct(c.success_rate),
            pct(c.interval.lower),
            pct(c.interval.upper),
            c.error_count,
            c.mean_wall_time_seconds,
            c.mean_total_tokens,
        ));
    }

    out.push_str("\n## Pairwise comparisons\n\n");
    out.push_str("| A | B | Δ rate (A−B) | CI | Verdict |\n");
    out.push_str("|---|---|--------------|----|---------|\n");
    for cmp in &analysis.comparisons {
        let verdict = if cmp.inconclusive {
            "inconclusive (sample too small)"
        } else if cmp.excludes_zero {
            "difference detected"
        } else {
            "no detectable difference"
        };
        out.push_str(&format!(
            "| {} | {} | {:+.1}pp | [{:+.1}pp, {:+.1}pp] | {} |\n",
            cmp.condition_a,
            cmp.condition_b,
            cmp.rate_difference * 100.0,
            cmp.interval.lower * 100.0,
            cmp.interval.upper * 100.0,
            verdict,
        ));
    }

    if analysis.total_errors > 0 {
        out.push_str(&format!(
            "\n## Harness errors\n\n{} of {} records are `error` outcomes — harness \
             malfunctions, not assistant failures. They are excluded from the rates above; \
             fix the infrastructure and resume the run set to fill them in.\n",
            analysis.total_errors, analysis.total_records
        ));
    }

    out
}
