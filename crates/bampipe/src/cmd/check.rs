use bampipe_backend::{BamType, Direction, MemoryType, PeerRole};
use bampipe_config::PipeTable;
use serde::Serialize;

use crate::cmd::{load_table, CheckArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, table, tag, OutputFormat, SCHEMA_BASE};

#[derive(Debug, Serialize)]
struct PipeRow<'a> {
    index: usize,
    label: &'a str,
    bam: BamType,
    peer: PeerRole,
    dir: Direction,
    pipe_num: u8,
    mem_type: MemoryType,
    local_pipe_index: u32,
    data_fifo_size: u32,
    desc_fifo_size: u32,
    reset_on_connect: bool,
}

#[derive(Debug, Serialize)]
struct CheckOutput<'a> {
    schema_id: String,
    config: String,
    valid: bool,
    num_pipes: u32,
    fifo_base_addr: u32,
    qdss_core: Option<BamType>,
    instances: Vec<BamType>,
    pipes: Vec<PipeRow<'a>>,
}

pub fn run(args: CheckArgs, format: OutputFormat) -> CliResult<i32> {
    let pipes = load_table(&args.config)?;
    let output = report(&pipes, args.config.display().to_string());
    print_check(&output, format);
    Ok(SUCCESS)
}

fn report(pipes: &PipeTable, config: String) -> CheckOutput<'_> {
    CheckOutput {
        schema_id: format!("{SCHEMA_BASE}/pipe-table-check.schema.json"),
        config,
        valid: true,
        num_pipes: pipes.num_pipes,
        fifo_base_addr: pipes.fifo_base_addr,
        qdss_core: pipes.qdss_core,
        instances: pipes.instances(),
        pipes: pipes
            .pipes
            .iter()
            .enumerate()
            .map(|(index, pipe)| PipeRow {
                index,
                label: &pipe.label,
                bam: pipe.bam,
                peer: pipe.peer,
                dir: pipe.dir,
                pipe_num: pipe.pipe_num,
                mem_type: pipe.mem_type,
                local_pipe_index: pipe.local_pipe_index(),
                data_fifo_size: pipe.data_fifo_size,
                desc_fifo_size: pipe.desc_fifo_size,
                reset_on_connect: pipe.reset_on_connect,
            })
            .collect(),
    }
}

fn print_check(output: &CheckOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table => {
            let mut rows = table(["#", "LABEL", "BAM", "PEER", "DIR", "MEM", "PIPE", "DATA", "DESC"]);
            for pipe in &output.pipes {
                rows.add_row(vec![
                    pipe.index.to_string(),
                    pipe.label.to_string(),
                    tag(&pipe.bam),
                    tag(&pipe.peer),
                    tag(&pipe.dir),
                    tag(&pipe.mem_type),
                    pipe.local_pipe_index.to_string(),
                    pipe.data_fifo_size.to_string(),
                    pipe.desc_fifo_size.to_string(),
                ]);
            }
            println!("{rows}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}: {} pipes over {} instances",
                output.config,
                output.pipes.len(),
                output.instances.len()
            );
            for pipe in &output.pipes {
                println!(
                    "  [{}] {} bam={} peer={} dir={} mem={}",
                    pipe.index,
                    pipe.label,
                    tag(&pipe.bam),
                    tag(&pipe.peer),
                    tag(&pipe.dir),
                    tag(&pipe.mem_type)
                );
            }
        }
    }
}
