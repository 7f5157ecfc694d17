use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use blegate::{
    Args, GatewayConfig, OutputFormat, SystemTerminalClient, fake_radio, real_radio,
    run_with_clients,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let log_level = args.log_level();
        let output_format = args.output_format().unwrap_or(if stdout.is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        });
        let config = GatewayConfig::load_or_default(args.config_path())?
            .with_overrides(&args.overrides());
        config.validate()?;
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let radio = match maybe_fake_args {
            Some(fake_args) => fake_radio(fake_args),
            None => real_radio().await?,
        };

        run_with_clients(
            command,
            &mut stdout,
            &SystemTerminalClient,
            radio,
            config,
            log_level,
            output_format,
        )
        .await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
