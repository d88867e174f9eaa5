//! Rendering of fleet command results.

use crate::Format;
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use service_orchestration::{
    CommandResults, HealthState, OperationDetails, OperationResult, ResultStatus,
};

/// Print `results` to stdout in the requested format
pub fn print(results: &CommandResults, format: Format, verbose: bool) -> Result<()> {
    match format {
        Format::Json => println!("{}", render_json(results)?),
        Format::Table => println!("{}", render_table(results, verbose)),
    }
    Ok(())
}

/// Results as pretty JSON
pub fn render_json(results: &CommandResults) -> Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}

fn status_color(result: &OperationResult) -> Color {
    match result.status {
        ResultStatus::Failed => Color::Red,
        ResultStatus::Skipped | ResultStatus::DryRun | ResultStatus::ForceContinued => {
            Color::Yellow
        }
        ResultStatus::Stopped | ResultStatus::Unknown => Color::DarkGrey,
        _ => Color::Green,
    }
}

fn health_cell(health: Option<HealthState>) -> Cell {
    match health {
        Some(state) => {
            let color = match state {
                HealthState::Healthy => Color::Green,
                HealthState::Degraded => Color::Yellow,
                HealthState::Unhealthy => Color::Red,
                HealthState::Unknown => Color::DarkGrey,
            };
            Cell::new(state.as_str()).fg(color)
        }
        None => Cell::new("-"),
    }
}

/// First line of an error, unless verbose
fn error_text(error: &str, verbose: bool) -> String {
    if verbose {
        error.to_string()
    } else {
        error.lines().next().unwrap_or_default().to_string()
    }
}

/// One-line description of what an operation did
pub fn describe(result: &OperationResult, verbose: bool) -> String {
    if let Some(error) = &result.error {
        return error_text(error, verbose);
    }
    if result.dry_run {
        return format!("would {}", result.operation);
    }

    match &result.details {
        OperationDetails::None => "-".to_string(),
        OperationDetails::Start(start) => {
            let mut text = start.resource.describe();
            if start.adopted {
                text.push_str(" (adopted)");
            }
            text
        }
        OperationDetails::Stop(stop) => match (&stop.resource, stop.already_stopped) {
            (_, true) => "already stopped".to_string(),
            (Some(resource), false) => resource.describe(),
            (None, false) => "stopped".to_string(),
        },
        OperationDetails::Check(check) => {
            let mut parts = vec![match &check.resource {
                Some(resource) => resource.describe(),
                None => "no instance".to_string(),
            }];
            match (&check.drift, check.record_deleted) {
                (Some(reason), true) => parts.push(format!("drift: {}, record removed", reason)),
                (Some(reason), false) => parts.push(format!("drift: {}", reason)),
                (None, _) => {}
            }
            if let Some(logs) = &check.logs {
                if logs.errors > 0 {
                    parts.push(format!("{} log errors", logs.errors));
                }
            }
            parts.join("; ")
        }
        OperationDetails::Restart(restart) => {
            let stop = if restart.stop.success { "stopped" } else { "stop failed" };
            match &restart.start {
                Some(start) if start.success => format!("{}, started", stop),
                Some(_) => format!("{}, start failed", stop),
                None => stop.to_string(),
            }
        }
        OperationDetails::Update(update) => {
            let version = match (&update.previous_version, &update.version) {
                (Some(previous), Some(version)) => format!("{} -> {}", previous, version),
                (None, Some(version)) => version.clone(),
                _ => "updated".to_string(),
            };
            format!("{} (downtime {} ms)", version, update.downtime_ms)
        }
        OperationDetails::Provision(provision) => provision.resources.join(", "),
        OperationDetails::Publish(publish) => publish.destination.clone(),
        OperationDetails::Backup(backup) => backup.artifact.clone(),
        OperationDetails::Restore(restore) => format!("from {}", restore.artifact),
        OperationDetails::Exec(exec) | OperationDetails::Test(exec) => match exec.exit_code {
            Some(code) => format!("exit {}", code),
            None => "killed by signal".to_string(),
        },
        OperationDetails::Destroy(destroy) => {
            if destroy.resources.is_empty() {
                "nothing to remove".to_string()
            } else {
                destroy.resources.join(", ")
            }
        }
    }
}

/// Results as a table followed by captured output, warnings and a summary line
pub fn render_table(results: &CommandResults, verbose: bool) -> String {
    let mut table = Table::new();
    table.set_header(vec![
        "SERVICE", "TARGET", "STATUS", "HEALTH", "DURATION", "DETAILS",
    ]);

    for result in &results.results {
        table.add_row(vec![
            Cell::new(&result.service),
            Cell::new(result.deployment.as_str()),
            Cell::new(result.status.as_str()).fg(status_color(result)),
            health_cell(result.health()),
            Cell::new(format!("{} ms", result.duration_ms)),
            Cell::new(describe(result, verbose)),
        ]);
    }

    let mut out = table.to_string();

    for result in &results.results {
        if let OperationDetails::Exec(exec) | OperationDetails::Test(exec) = &result.details {
            if !exec.stdout.is_empty() || !exec.stderr.is_empty() {
                out.push_str(&format!("\n--- {} ---\n", result.service));
                out.push_str(exec.stdout.trim_end());
                if !exec.stderr.is_empty() {
                    out.push('\n');
                    out.push_str(exec.stderr.trim_end());
                }
            }
        }
    }

    for result in &results.results {
        for warning in &result.warnings {
            out.push_str(&format!("\n! {}: {}", result.service, warning));
        }
        if verbose {
            for recommendation in &result.recommendations {
                out.push_str(&format!("\n  hint ({}): {}", result.service, recommendation));
            }
        }
    }

    let summary = &results.summary;
    out.push_str(&format!(
        "\n{} in {}: {} succeeded, {} failed, {} warnings ({} ms){}",
        results.command,
        results.environment,
        summary.succeeded,
        summary.failed,
        summary.warnings,
        results.duration_ms,
        if results.context.dry_run { " [dry-run]" } else { "" }
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_orchestration::{
        DeploymentTarget, ExecutionContext, Operation, ResourceId, StartDetails, Summary,
    };

    fn results(items: Vec<OperationResult>) -> CommandResults {
        CommandResults {
            command: "start".to_string(),
            environment: "staging".to_string(),
            timestamp: items
                .first()
                .map(|r| r.timestamp)
                .unwrap_or_default(),
            duration_ms: 12,
            summary: Summary::from_results(&items),
            results: items,
            context: ExecutionContext {
                user: "ops".to_string(),
                working_directory: "/srv".to_string(),
                dry_run: false,
            },
        }
    }

    fn started(service: &str) -> OperationResult {
        let mut result =
            OperationResult::new(Operation::Start, service, DeploymentTarget::Process, "staging");
        result.details = OperationDetails::Start(StartDetails {
            resource: ResourceId::process(4242, Some(8080)),
            adopted: true,
            endpoint: None,
        });
        result
    }

    #[test]
    fn test_describe_start_and_failure() {
        let result = started("api-backend");
        let text = describe(&result, false);
        assert!(text.ends_with("(adopted)"), "{}", text);

        let failed = OperationResult::new(
            Operation::Stop,
            "gateway",
            DeploymentTarget::External,
            "staging",
        )
        .fail("stop is not supported\nraw upstream detail");
        assert_eq!(describe(&failed, false), "stop is not supported");
        assert!(describe(&failed, true).contains("raw upstream detail"));
    }

    #[test]
    fn test_table_lists_services_and_summary() {
        let mut refused = OperationResult::new(
            Operation::Start,
            "gateway",
            DeploymentTarget::External,
            "staging",
        )
        .fail("not reachable");
        refused.recommendations = vec!["Ask the owners".to_string()];

        let rendered = render_table(&results(vec![started("api-backend"), refused.clone()]), false);
        assert!(rendered.contains("api-backend"));
        assert!(rendered.contains("gateway"));
        assert!(rendered.contains("start in staging: 1 succeeded, 1 failed, 0 warnings"));
        assert!(!rendered.contains("Ask the owners"));

        let verbose = render_table(&results(vec![refused]), true);
        assert!(verbose.contains("hint (gateway): Ask the owners"));
    }

    #[test]
    fn test_json_is_camel_case() {
        let json = render_json(&results(vec![started("api-backend")])).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["total"], 1);
        assert_eq!(value["results"][0]["durationMs"], 0);
        assert_eq!(value["results"][0]["details"]["kind"], "start");
        assert_eq!(value["context"]["dryRun"], false);
    }
}
