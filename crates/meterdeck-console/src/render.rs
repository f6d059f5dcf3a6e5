use meterdeck_control::{
    notice::Notice, verification::VerificationReport, wire::AuditEntry, wire::TelemetrySample,
    Device, DeviceStatus, OutputChannel,
};

pub fn device_lines(devices: &[Device]) -> Vec<String> {
    devices
        .iter()
        .map(|device| {
            let outputs = device
                .outputs
                .as_ref()
                .map(|list| list.len().to_string())
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{:<16} {:<24} {:<16} outputs={}",
                device.device_id,
                ellipsize(device.label(), 24),
                ellipsize(&device.project, 16),
                outputs
            )
        })
        .collect()
}

pub fn status_lines(device_id: &str, status: &DeviceStatus) -> Vec<String> {
    if status.is_empty() {
        return vec![format!("{device_id}: no status yet")];
    }
    status
        .iter()
        .map(|(key, record)| {
            let pending = match record.pending_since {
                Some(since) => format!("  pending since {}", since.format("%H:%M:%S")),
                None => String::new(),
            };
            format!(
                "{device_id} {:<12} {:<6} {}{pending}",
                key,
                record.status.as_str(),
                record.value
            )
        })
        .collect()
}

pub fn output_lines(outputs: &[OutputChannel]) -> Vec<String> {
    outputs
        .iter()
        .map(|output| {
            format!(
                "{:<12} {:<12} target={:<12} {}",
                output.key, output.address, output.control_target, output.description
            )
        })
        .collect()
}

pub fn audit_lines(entries: &[AuditEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let at = entry
                .executed_at_utc()
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| entry.executed_at.clone());
            format!(
                "{at}  {:<16} {:<6} {:<8} by {}",
                entry.device_id, entry.action, entry.status, entry.operator
            )
        })
        .collect()
}

pub fn report_lines(report: &VerificationReport) -> Vec<String> {
    let mut lines = vec![format!(
        "verification #{} {} {}: {} after {} ms, {} samples",
        report.verification_id,
        report.action,
        report.device_id,
        report.verdict,
        report.elapsed_ms,
        report.samples
    )];
    lines.push(format!("  baseline {}", sample_text(report.baseline.as_ref())));
    lines.push(format!("  final    {}", sample_text(report.final_sample.as_ref())));
    if let Some(error) = &report.error {
        lines.push(format!("  error    {error}"));
    }
    lines
}

pub fn notice_line(notice: &Notice) -> String {
    format!(
        "[{}] {} {}",
        notice.at.format("%H:%M:%S"),
        notice.level,
        notice.message
    )
}

fn sample_text(sample: Option<&TelemetrySample>) -> String {
    let Some(sample) = sample else {
        return "unavailable".to_string();
    };
    let reading = |value: Option<f64>, unit: &str| match value {
        Some(value) => format!("{value:.2} {unit}"),
        None => format!("- {unit}"),
    };
    format!(
        "{} / {}",
        reading(sample.current_avg, "A"),
        reading(sample.power_total, "kW")
    )
}

fn ellipsize(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = value.chars().take(keep).collect();
    out.push_str("...");
    out
}
