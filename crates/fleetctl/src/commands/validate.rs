use super::Invocation;
use crate::Format;
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use serde::Serialize;
use service_orchestration::ServiceDefinition;
use std::process::ExitCode;

/// What `validate` reports
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationReport {
    config: String,
    environment: String,
    valid: bool,
    services: Vec<ServiceLine>,
    problems: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ServiceLine {
    name: String,
    deployment: String,
    target: String,
}

/// What a service points at, for display
fn target_of(definition: &ServiceDefinition) -> String {
    let settings = &definition.settings;
    settings
        .image
        .clone()
        .or_else(|| settings.endpoint.clone())
        .or_else(|| (!settings.command.is_empty()).then(|| settings.command.join(" ")))
        .unwrap_or_else(|| "-".to_string())
}

/// Load and resolve the configuration without touching any platform
pub fn run(invocation: &Invocation) -> Result<ExitCode> {
    let report = match fleet_config::load(
        &invocation.config_path,
        &invocation.environment,
        &invocation.env,
    ) {
        Ok(resolved) => ValidationReport {
            config: invocation.config_path.display().to_string(),
            environment: invocation.environment.clone(),
            valid: true,
            services: resolved
                .services
                .iter()
                .map(|definition| ServiceLine {
                    name: definition.name().to_string(),
                    deployment: definition.deployment.to_string(),
                    target: target_of(definition),
                })
                .collect(),
            problems: Vec::new(),
        },
        Err(err) => ValidationReport {
            config: invocation.config_path.display().to_string(),
            environment: invocation.environment.clone(),
            valid: false,
            services: Vec::new(),
            problems: err.problems(),
        },
    };

    match invocation.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Table => print_report(&report),
    }

    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_report(report: &ValidationReport) {
    println!(
        "Validating {} for environment '{}'...",
        report.config, report.environment
    );

    if !report.valid {
        println!("✗ Configuration invalid");
        for problem in &report.problems {
            println!("  - {}", problem);
        }
        return;
    }

    println!("✓ Configuration valid");
    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "DEPLOYMENT", "TARGET"]);
    for line in &report.services {
        table.add_row(vec![
            Cell::new(&line.name),
            Cell::new(&line.deployment).fg(Color::Cyan),
            Cell::new(&line.target),
        ]);
    }
    println!("{}", table);
}
