//! Hideaway
//!
//! Administration CLI for the secure files area.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use access::path::{self, NormalizedPath};
use access::{AuthMethod, Policy, PolicyDraft, Principal, SessionContext, Verdict};
use clap::{Parser, Subcommand};
use gateway::files::{DirectoryEntry, EntryType};
use gateway::{logging, Config, Gateway};

/// Hideaway - access control for a protected files area.
#[derive(Parser, Debug)]
#[command(name = "hideaway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect or rotate the secure root
    #[command(subcommand)]
    Root(RootCommands),

    /// Inspect and refresh the danger flag
    #[command(subcommand)]
    Danger(DangerCommands),

    /// Manage directory access policies
    #[command(subcommand)]
    Policy(PolicyCommands),

    /// Resolve a relative path against the secure root
    Resolve {
        /// Root-relative path
        path: String,
    },

    /// List a directory inside the secure root
    Ls {
        /// Root-relative directory (defaults to the root)
        path: Option<String>,

        /// Include hidden entries
        #[arg(long, short)]
        all: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove a file or directory tree inside the secure root
    Rm {
        /// Root-relative path
        path: String,
    },

    /// Download a file through a one-time link
    Download {
        /// Root-relative file path
        path: String,

        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Principal to authenticate as
        #[arg(long)]
        principal: Option<String>,

        /// Role held by the principal (repeatable)
        #[arg(long = "role", value_name = "ROLE")]
        roles: Vec<String>,

        /// Shared secret for the directory
        #[arg(long)]
        secret: Option<String>,
    },
}

/// Subcommands for the secure root.
#[derive(Subcommand, Debug, Clone)]
pub enum RootCommands {
    /// Show the active root and retired roots
    Show,

    /// Replace the active root with a fresh directory
    Rotate,
}

/// Subcommands for danger detection.
#[derive(Subcommand, Debug, Clone)]
pub enum DangerCommands {
    /// Assess an arbitrary directory without changing the flag
    Assess {
        /// Directory to assess
        path: PathBuf,
    },

    /// Show the persisted danger state
    Status,

    /// Re-assess the active root, clearing the flag if it is safe
    Revalidate,
}

/// Subcommands for access policies.
#[derive(Subcommand, Debug, Clone)]
pub enum PolicyCommands {
    /// Show the effective policy for a directory
    Show {
        /// Root-relative directory (defaults to the root)
        dir: Option<String>,
    },

    /// Set the policy of a directory
    Set {
        /// Root-relative directory
        dir: String,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Remove the policy of a directory
    Remove {
        /// Root-relative directory
        dir: String,
    },

    /// List every directory policy
    List,

    /// Print the shared secret configured for a directory
    Reveal {
        /// Root-relative directory
        dir: String,
    },

    /// Show or replace the global policy
    #[command(subcommand)]
    Global(GlobalPolicyCommands),
}

/// Subcommands for the global policy.
#[derive(Subcommand, Debug, Clone)]
pub enum GlobalPolicyCommands {
    /// Show the global policy
    Show,

    /// Replace the global policy
    Set {
        #[command(flatten)]
        policy: PolicyArgs,
    },
}

/// Policy fields shared by `policy set` and `policy global set`.
#[derive(clap::Args, Debug, Clone)]
pub struct PolicyArgs {
    /// Accepted method: session or shared-secret (repeatable; none denies all)
    #[arg(long = "method", value_name = "METHOD")]
    pub methods: Vec<AuthMethod>,

    /// Role accepted by session authentication (repeatable)
    #[arg(long = "role", value_name = "ROLE")]
    pub roles: Vec<String>,

    /// Shared secret, required with the shared-secret method
    #[arg(long)]
    pub secret: Option<String>,
}

impl PolicyArgs {
    fn into_draft(self) -> PolicyDraft {
        let draft = PolicyDraft::new(self.methods).with_roles(self.roles.iter().map(String::as_str));
        match self.secret {
            Some(secret) => draft.with_secret(secret),
            None => draft,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let _log_guard = logging::init(
        &config.general.log_level,
        cli.verbose,
        config.general.log_file.as_deref(),
    )?;
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    let mut gateway = Gateway::open(config)?;

    match cli.command {
        Commands::Root(cmd) => match cmd {
            RootCommands::Show => {
                let root = gateway.root();
                println!("Secure root:");
                println!("  ID:   {}", root.id);
                println!("  Path: {}", root.path.as_path().display());

                let retired = gateway.retired_roots()?;
                if !retired.is_empty() {
                    println!("Retired roots:");
                    for id in retired {
                        println!("  {}", id);
                    }
                }
            }
            RootCommands::Rotate => {
                let root = gateway.rotate_root()?;
                println!("Secure root rotated to {}", root.id);
                println!("  Path: {}", root.path.as_path().display());
            }
        },
        Commands::Danger(cmd) => match cmd {
            DangerCommands::Assess { path } => {
                let verdict = gateway.assess(&path);
                println!("{}: {}", path.display(), verdict_label(verdict));
            }
            DangerCommands::Status => {
                let state = gateway.danger_state();
                println!(
                    "Danger flag: {}",
                    if state.flag { "set (downloads blocked)" } else { "clear" }
                );
                println!("  Verdict:  {}", verdict_label(state.verdict));
                if let Some(path) = &state.assessed_path {
                    println!("  Assessed: {}", path.display());
                }
                if let Some(at) = state.assessed_at {
                    println!("  When:     {}", format_relative_time(at));
                }
            }
            DangerCommands::Revalidate => {
                let verdict = gateway.revalidate()?;
                if verdict.is_safe() {
                    println!("Secure root is safe; danger flag cleared");
                } else {
                    println!(
                        "Secure root is still dangerous ({}); downloads remain blocked",
                        verdict_label(verdict)
                    );
                }
            }
        },
        Commands::Policy(cmd) => run_policy(&gateway, cmd)?,
        Commands::Resolve { path: relative } => {
            let resolved = path::resolve(&gateway.root().path, &relative)?;
            println!("{}", resolved.as_path().display());
        }
        Commands::Ls {
            path: relative,
            all,
            json,
        } => {
            let relative = relative.unwrap_or_default();
            let entries = gateway.browser().list_directory(&relative, all)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries_table(&entries);
            }
        }
        Commands::Rm { path: relative } => {
            let summary = gateway.remove(&relative)?;
            println!(
                "Removed {} file(s) and {} directory(ies)",
                summary.files, summary.directories
            );
        }
        Commands::Download {
            path: relative,
            output,
            principal,
            roles,
            secret,
        } => {
            let mut session = match principal {
                Some(id) => SessionContext::for_principal(Principal::new(
                    id,
                    roles.iter().map(String::as_str),
                )),
                None => SessionContext::anonymous(),
            };

            match output {
                Some(output_path) => {
                    let file = File::create(&output_path)?;
                    let mut writer = BufWriter::new(file);
                    let downloaded =
                        gateway.download(&relative, &mut session, secret.as_deref(), &mut writer);
                    drop(writer);
                    match downloaded {
                        Ok((info, written)) => {
                            println!(
                                "Saved {} ({}, {}) to {}",
                                info.file_name,
                                info.mime,
                                format_size(written),
                                output_path.display()
                            );
                        }
                        Err(e) => {
                            let _ = std::fs::remove_file(&output_path);
                            return Err(e);
                        }
                    }
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut writer = stdout.lock();
                    gateway.download(&relative, &mut session, secret.as_deref(), &mut writer)?;
                    writer.flush()?;
                }
            }
        }
    }

    Ok(())
}

fn run_policy(gateway: &Gateway, cmd: PolicyCommands) -> anyhow::Result<()> {
    let policies = gateway.policies();

    match cmd {
        PolicyCommands::Show { dir } => {
            let dir = existing_dir(gateway, dir.as_deref().unwrap_or_default())?;
            let explicit = policies.directory_policy(&dir)?;
            let effective = policies.effective_policy(&dir);
            println!(
                "Policy for {} ({})",
                dir,
                if explicit.is_some() { "explicit" } else { "inherited" }
            );
            print_policy(&effective);
        }
        PolicyCommands::Set { dir, policy } => {
            let dir = existing_dir(gateway, &dir)?;
            let stored = policies.set_policy(&dir, policy.into_draft())?;
            println!("Policy for {} updated", dir);
            print_policy(&stored);
        }
        PolicyCommands::Remove { dir } => {
            let dir = NormalizedPath::new(&dir);
            if policies.remove_policy(&dir)? {
                println!("Policy for {} removed", dir);
            } else {
                println!("No policy set for {}", dir);
            }
        }
        PolicyCommands::List => {
            let all = policies.list_policies()?;
            print_policies_table(&all);
        }
        PolicyCommands::Reveal { dir } => {
            let dir = NormalizedPath::new(&dir);
            match policies.reveal_secret(&dir)? {
                Some(secret) => println!("{}", secret),
                None => anyhow::bail!("No shared secret set for {}", dir),
            }
        }
        PolicyCommands::Global(cmd) => match cmd {
            GlobalPolicyCommands::Show => {
                println!("Global policy");
                print_policy(&policies.global_policy()?);
            }
            GlobalPolicyCommands::Set { policy } => {
                let stored = policies.set_global_policy(policy.into_draft())?;
                println!("Global policy updated");
                print_policy(&stored);
            }
        },
    }

    Ok(())
}

/// Resolve `dir` inside the root and require it to be a directory.
fn existing_dir(gateway: &Gateway, dir: &str) -> anyhow::Result<NormalizedPath> {
    let root = &gateway.root().path;
    let resolved = path::resolve(root, dir)?;
    if !resolved.as_path().is_dir() {
        anyhow::bail!("Not a directory: {}", dir);
    }
    Ok(path::relative_to(root, &resolved)?)
}

fn print_policy(policy: &Policy) {
    println!("  Methods: {}", join_or_dash(policy.auth_methods.iter()));
    println!("  Roles:   {}", join_or_dash(policy.allowed_roles.iter()));
    println!(
        "  Secret:  {}",
        if policy.secret.is_some() { "set" } else { "none" }
    );
}

/// Print policies in a formatted ASCII table.
fn print_policies_table(policies: &[(NormalizedPath, Policy)]) {
    if policies.is_empty() {
        println!("No directory policies.");
        return;
    }

    // Calculate column widths
    let dir_width = policies
        .iter()
        .map(|(dir, _)| dir.as_str().len())
        .max()
        .unwrap_or(9)
        .max(9);
    let rows: Vec<(String, String)> = policies
        .iter()
        .map(|(_, policy)| {
            (
                join_or_dash(policy.auth_methods.iter()),
                join_or_dash(policy.allowed_roles.iter()),
            )
        })
        .collect();
    let methods_width = rows.iter().map(|(m, _)| m.len()).max().unwrap_or(7).max(7);

    println!(
        "{:<dir_width$}  {:<methods_width$}  ROLES",
        "DIRECTORY",
        "METHODS",
        dir_width = dir_width,
        methods_width = methods_width
    );
    println!("{}", "-".repeat(dir_width + methods_width + 9));

    for ((dir, _), (methods, roles)) in policies.iter().zip(rows) {
        println!(
            "{:<dir_width$}  {:<methods_width$}  {}",
            dir.as_str(),
            methods,
            roles,
            dir_width = dir_width,
            methods_width = methods_width
        );
    }

    println!();
    println!("Total: {} policy(ies)", policies.len());
}

/// Print directory entries in a formatted ASCII table.
fn print_entries_table(entries: &[DirectoryEntry]) {
    if entries.is_empty() {
        println!("Directory is empty.");
        return;
    }

    println!("{:<4}  {:>10}  {:>10}  NAME", "TYPE", "SIZE", "MODIFIED");
    println!("{}", "-".repeat(34));

    for entry in entries {
        let kind = match entry.entry_type {
            EntryType::Directory => "dir",
            EntryType::File => "file",
            EntryType::Symlink => "link",
            EntryType::Other => "?",
        };
        let size = if entry.entry_type == EntryType::File {
            format_size(entry.size)
        } else {
            "-".to_string()
        };
        println!(
            "{:<4}  {:>10}  {:>10}  {}",
            kind,
            size,
            format_relative_time(entry.modified),
            entry.name
        );
    }

    println!();
    println!("Total: {} entr(ies)", entries.len());
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Safe => "safe",
        Verdict::HostRoot => "host application root",
        Verdict::DangerousSystemDir => "protected system directory",
        Verdict::ContainsHostFiles => "contains host application files",
    }
}

fn join_or_dash<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let joined = items.map(|item| item.to_string()).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}

/// Format a timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: SystemTime) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let then = timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(then);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Format a byte count with a binary unit.
fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_root_show() {
        let cli = Cli::try_parse_from(["hideaway", "root", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Root(RootCommands::Show)));
    }

    #[test]
    fn test_root_rotate() {
        let cli = Cli::try_parse_from(["hideaway", "root", "rotate"]).unwrap();
        assert!(matches!(cli.command, Commands::Root(RootCommands::Rotate)));
    }

    #[test]
    fn test_danger_assess() {
        let cli = Cli::try_parse_from(["hideaway", "danger", "assess", "/etc"]).unwrap();
        match cli.command {
            Commands::Danger(DangerCommands::Assess { path }) => {
                assert_eq!(path, PathBuf::from("/etc"));
            }
            _ => panic!("Expected Danger Assess command"),
        }
    }

    #[test]
    fn test_danger_status_and_revalidate() {
        let cli = Cli::try_parse_from(["hideaway", "danger", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Danger(DangerCommands::Status)));

        let cli = Cli::try_parse_from(["hideaway", "danger", "revalidate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Danger(DangerCommands::Revalidate)
        ));
    }

    #[test]
    fn test_policy_set_with_secret() {
        let cli = Cli::try_parse_from([
            "hideaway",
            "policy",
            "set",
            "Private",
            "--method",
            "shared-secret",
            "--secret",
            "hunter2",
        ])
        .unwrap();
        match cli.command {
            Commands::Policy(PolicyCommands::Set { dir, policy }) => {
                assert_eq!(dir, "Private");
                assert_eq!(policy.methods, vec![AuthMethod::SharedSecret]);
                assert!(policy.roles.is_empty());
                assert_eq!(policy.secret.as_deref(), Some("hunter2"));
            }
            _ => panic!("Expected Policy Set command"),
        }
    }

    #[test]
    fn test_policy_set_repeated_flags() {
        let cli = Cli::try_parse_from([
            "hideaway",
            "policy",
            "set",
            "Team",
            "--method",
            "session",
            "--method",
            "secret",
            "--role",
            "editor",
            "--role",
            "administrator",
            "--secret",
            "s3",
        ])
        .unwrap();
        match cli.command {
            Commands::Policy(PolicyCommands::Set { policy, .. }) => {
                assert_eq!(
                    policy.methods,
                    vec![AuthMethod::Session, AuthMethod::SharedSecret]
                );
                assert_eq!(policy.roles, vec!["editor", "administrator"]);

                let draft = policy.into_draft();
                assert_eq!(draft.auth_methods.len(), 2);
                assert_eq!(draft.allowed_roles.len(), 2);
                assert_eq!(draft.secret.as_deref(), Some("s3"));
            }
            _ => panic!("Expected Policy Set command"),
        }
    }

    #[test]
    fn test_policy_set_without_methods() {
        let cli = Cli::try_parse_from(["hideaway", "policy", "set", "Locked"]).unwrap();
        match cli.command {
            Commands::Policy(PolicyCommands::Set { policy, .. }) => {
                assert!(policy.into_draft().auth_methods.is_empty());
            }
            _ => panic!("Expected Policy Set command"),
        }
    }

    #[test]
    fn test_policy_invalid_method_fails() {
        let result = Cli::try_parse_from(["hideaway", "policy", "set", "X", "--method", "magic"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_show_defaults_to_root() {
        let cli = Cli::try_parse_from(["hideaway", "policy", "show"]).unwrap();
        match cli.command {
            Commands::Policy(PolicyCommands::Show { dir }) => assert!(dir.is_none()),
            _ => panic!("Expected Policy Show command"),
        }
    }

    #[test]
    fn test_policy_global_set() {
        let cli = Cli::try_parse_from([
            "hideaway", "policy", "global", "set", "--method", "session", "--role", "editor",
        ])
        .unwrap();
        match cli.command {
            Commands::Policy(PolicyCommands::Global(GlobalPolicyCommands::Set { policy })) => {
                assert_eq!(policy.methods, vec![AuthMethod::Session]);
                assert_eq!(policy.roles, vec!["editor"]);
            }
            _ => panic!("Expected Policy Global Set command"),
        }
    }

    #[test]
    fn test_policy_reveal_requires_dir() {
        assert!(Cli::try_parse_from(["hideaway", "policy", "reveal"]).is_err());
    }

    #[test]
    fn test_ls_defaults() {
        let cli = Cli::try_parse_from(["hideaway", "ls"]).unwrap();
        match cli.command {
            Commands::Ls { path, all, json } => {
                assert!(path.is_none());
                assert!(!all);
                assert!(!json);
            }
            _ => panic!("Expected Ls command"),
        }
    }

    #[test]
    fn test_ls_with_flags() {
        let cli = Cli::try_parse_from(["hideaway", "ls", "docs", "-a", "--json"]).unwrap();
        match cli.command {
            Commands::Ls { path, all, json } => {
                assert_eq!(path.as_deref(), Some("docs"));
                assert!(all);
                assert!(json);
            }
            _ => panic!("Expected Ls command"),
        }
    }

    #[test]
    fn test_download_with_principal() {
        let cli = Cli::try_parse_from([
            "hideaway",
            "download",
            "Private/report.pdf",
            "-o",
            "/tmp/report.pdf",
            "--principal",
            "alice",
            "--role",
            "administrator",
        ])
        .unwrap();
        match cli.command {
            Commands::Download {
                path,
                output,
                principal,
                roles,
                secret,
            } => {
                assert_eq!(path, "Private/report.pdf");
                assert_eq!(output, Some(PathBuf::from("/tmp/report.pdf")));
                assert_eq!(principal.as_deref(), Some("alice"));
                assert_eq!(roles, vec!["administrator"]);
                assert!(secret.is_none());
            }
            _ => panic!("Expected Download command"),
        }
    }

    #[test]
    fn test_download_requires_path() {
        assert!(Cli::try_parse_from(["hideaway", "download"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["hideaway", "-v", "-c", "/etc/hideaway.toml", "root", "show"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hideaway.toml")));
    }

    #[test]
    fn test_verbose_after_command() {
        let cli = Cli::try_parse_from(["hideaway", "danger", "status", "--verbose"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["hideaway"]).is_err());
        assert!(Cli::try_parse_from(["hideaway", "policy"]).is_err());
        assert!(Cli::try_parse_from(["hideaway", "policy", "global"]).is_err());
    }

    #[test]
    fn test_verdict_labels() {
        assert_eq!(verdict_label(Verdict::Safe), "safe");
        assert_eq!(
            verdict_label(Verdict::DangerousSystemDir),
            "protected system directory"
        );
    }

    #[test]
    fn test_join_or_dash() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(join_or_dash(empty.iter()), "-");
        assert_eq!(join_or_dash(["a", "b"].iter()), "a, b");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_format_relative_time() {
        assert_eq!(format_relative_time(SystemTime::now()), "0s ago");
        let earlier = SystemTime::now() - std::time::Duration::from_secs(7200);
        assert_eq!(format_relative_time(earlier), "2h ago");
    }
}
