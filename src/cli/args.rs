use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Terradozer - destroy all resources from a Terraform state file
///
/// Reads a state file and deletes every managed resource recorded in it,
/// without needing the *.tf configuration files.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a Terraform state file
    pub state_file: Option<PathBuf>,

    /// Show what would be deleted without actually destroying anything
    #[arg(long)]
    pub dry_run: bool,

    /// Delete without asking for confirmation
    #[arg(long)]
    pub force: bool,

    /// Limit the number of concurrent delete operations
    #[arg(long, default_value_t = 10)]
    pub parallel: usize,

    /// Amount of time to wait for a destroy of a resource to finish
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["terradozer", "terraform.tfstate"]);
        assert_eq!(cli.state_file, Some(PathBuf::from("terraform.tfstate")));
        assert!(!cli.dry_run);
        assert!(!cli.force);
        assert_eq!(cli.parallel, 10);
        assert_eq!(cli.timeout, Duration::from_secs(30));
        assert!(!cli.debug);
    }

    #[test]
    fn test_state_file_is_optional_at_parse_time() {
        // missing path is handled by the binary so it can exit with code 1
        let cli = Cli::parse_from(["terradozer"]);
        assert_eq!(cli.state_file, None);
    }

    #[test]
    fn test_timeout_parses_human_durations() {
        let cli = Cli::parse_from(["terradozer", "--timeout=2m30s", "terraform.tfstate"]);
        assert_eq!(cli.timeout, Duration::from_secs(150));

        let result = Cli::try_parse_from(["terradozer", "--timeout=later", "terraform.tfstate"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::parse_from([
            "terradozer",
            "--dry-run",
            "--parallel=3",
            "--timeout=5s",
            "--debug",
            "prod.tfstate",
        ]);
        assert!(cli.dry_run);
        assert_eq!(cli.parallel, 3);
        assert_eq!(cli.timeout, Duration::from_secs(5));
        assert!(cli.debug);
        assert_eq!(cli.state_file, Some(PathBuf::from("prod.tfstate")));
    }

    #[test]
    fn test_force_and_dry_run_both_parse() {
        // the conflict is rejected by the binary, not the parser, to keep
        // the exit code contract
        let cli = Cli::parse_from(["terradozer", "--force", "--dry-run", "terraform.tfstate"]);
        assert!(cli.force);
        assert!(cli.dry_run);
    }
}
