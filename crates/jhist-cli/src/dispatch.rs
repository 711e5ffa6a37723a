use std::time::Duration;

use anyhow::Result;
use jhist_core::{commands, config, ArchiveError, Config};

use crate::cli::{CommandCli, ConfigCommand};

/// Runs one sub-command, returning the process exit code.
pub fn dispatch_command(config: &Config, command: &CommandCli) -> Result<i32> {
    match command {
        CommandCli::Build(args) => {
            let request = commands::BuildRequest {
                versions: args.versions.clone(),
                asserts: args.asserts,
                jobs: args.jobs,
                threads: args.threads,
                timeout: args.timeout.map(Duration::from_secs),
                work_dir: args.work_dir.clone(),
            };
            let all_ok = commands::build(config, &request)?;
            Ok(i32::from(!all_ok))
        }
        CommandCli::Run(args) => match commands::run(config, &args.rev, &args.args) {
            Ok(output) => {
                if output.term_signal != 0 {
                    // Die the same way the child did so a bisect driver
                    // sees a faithful status; the additive code is only a
                    // fallback if re-raising is refused.
                    let _ = jhist_core::process::reraise(output.term_signal);
                    return Ok(128 + output.term_signal);
                }
                Ok(output.code)
            }
            Err(err) => archive_exit(err),
        },
        CommandCli::Extract(args) => match commands::extract(config, &args.rev, &args.dir) {
            Ok(()) => Ok(0),
            Err(err) => archive_exit(err),
        },
        CommandCli::Verify(args) => {
            let reports = commands::verify(config, &args.versions, args.asserts, args.fix)?;
            let mut all_ok = true;
            for report in &reports {
                if report.ok() {
                    println!("{}: {} pack(s) conform", report.database, report.packs_checked);
                } else {
                    all_ok = false;
                    for issue in &report.issues {
                        let verdict = if report.fixed { "deleted" } else { "invalid" };
                        if issue.known_pack {
                            println!(
                                "{}: pack {} holds {} foreign revision(s) ({verdict})",
                                report.database,
                                issue.pack,
                                issue.unexpected.len()
                            );
                        } else {
                            println!(
                                "{}: pack {} is not in the plan ({verdict})",
                                report.database, issue.pack
                            );
                        }
                    }
                }
            }
            Ok(i32::from(!all_ok))
        }
        CommandCli::Status(args) => {
            let reports = commands::status(config, args.version.as_deref(), args.asserts)?;
            for report in &reports {
                println!(
                    "{}: {}/{} commits stored ({} missing), {} pack(s), {} loose",
                    report.database,
                    report.stored,
                    report.total,
                    report.missing(),
                    report.packs,
                    report.loose
                );
            }
            Ok(0)
        }
        CommandCli::Config(args) => match &args.command {
            ConfigCommand::DataDir { path } => {
                if let Some(path) = path {
                    config::set_data_dir_preference(path)?;
                    println!("data-dir = {}", path.display());
                } else {
                    match config::data_dir_preference()? {
                        Some(path) => println!("data-dir = {}", path.display()),
                        None => println!("data-dir = {} (default)", config.data_dir.display()),
                    }
                }
                Ok(0)
            }
        },
    }
}

// Archive errors carry their own exit codes (125 for unknown or unstored
// revisions); anything else propagates as a failure.
fn archive_exit(err: anyhow::Error) -> Result<i32> {
    match err.downcast_ref::<ArchiveError>() {
        Some(archive) => {
            eprintln!("jhist ▸ {archive}");
            Ok(archive.exit_code())
        }
        None => Err(err),
    }
}
