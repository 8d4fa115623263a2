use bampipe_manager::{BamManager, InstanceStatus, TimerUpdate};
use serde::Serialize;

use crate::cmd::{load_table, runtime, start_simulated, TimersArgs};
use crate::exit::{bam_error, CliResult, SUCCESS};
use crate::output::{print_json, table, tag, OutputFormat, SCHEMA_BASE};

#[derive(Debug, Serialize)]
struct TimersOutput {
    schema_id: String,
    applied: bool,
    instances: Vec<InstanceStatus>,
}

pub fn run(args: TimersArgs, format: OutputFormat) -> CliResult<i32> {
    let pipes = load_table(&args.config)?;
    runtime()?.block_on(async move {
        let (_sim, manager) = start_simulated(pipes)?;
        let result = apply(&manager, args.set.as_deref(), format);
        if let Err(err) = manager.shutdown().await {
            tracing::warn!(error = %err, "manager shutdown reported an error");
        }
        result
    })
}

fn apply(manager: &BamManager, set: Option<&str>, format: OutputFormat) -> CliResult<i32> {
    let applied = match set {
        Some(input) => match manager
            .store_inactivity_timers(input)
            .map_err(|err| bam_error("invalid timer settings", err))?
        {
            TimerUpdate::Usage(usage) => {
                print!("{usage}");
                return Ok(SUCCESS);
            }
            TimerUpdate::Applied(settings) => {
                tracing::info!(count = settings.len(), "timer settings applied");
                true
            }
        },
        None => false,
    };

    match format {
        OutputFormat::Json => print_json(&TimersOutput {
            schema_id: format!("{SCHEMA_BASE}/inactivity-timers.schema.json"),
            applied,
            instances: manager.instances(),
        }),
        OutputFormat::Table => {
            let mut rows = table(["INSTANCE", "TIMEOUT", "ENABLED PIPES"]);
            for inst in manager.instances() {
                rows.add_row(vec![
                    tag(&inst.bam),
                    format!("{}ms", inst.inactivity_timer_ms),
                    inst.enabled_pipes.to_string(),
                ]);
            }
            println!("{rows}");
        }
        OutputFormat::Pretty => print!("{}", manager.show_inactivity_timers()),
    }
    Ok(SUCCESS)
}
