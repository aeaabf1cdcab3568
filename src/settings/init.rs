use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::settings::{
    Config, FilterConfig, ImapConfig, ServerConfig, SmtpConfig, SubjectConfig, WatchConfig,
};

/// Interactively asks for every required setting and writes `path`.
pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        );
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    println!("Let's set up your {}!", path.display());

    println!("\n--- IMAP ---");
    let imap = ImapConfig {
        server: prompt(&mut input, "IMAP server (e.g. imap.strato.de): ")?,
        port: prompt_port(&mut input, "IMAP port [993]: ", 993)?,
        security: "ssl".to_string(),
        username: prompt(&mut input, "IMAP username: ")?,
        password: rpassword::prompt_password("IMAP password: ")?,
        mailbox: "INBOX".to_string(),
    };

    println!("\n--- SMTP ---");
    let smtp = SmtpConfig {
        server: prompt(&mut input, "SMTP server (e.g. smtp.strato.de): ")?,
        port: prompt_port(&mut input, "SMTP port [465]: ", 465)?,
        security: or_default(prompt(&mut input, "SMTP security (ssl/starttls) [ssl]: ")?, "ssl"),
        username: prompt(&mut input, "SMTP username: ")?,
        password: rpassword::prompt_password("SMTP password: ")?,
    };

    println!("\n--- FILTER ---");
    let from = split_list(&prompt(
        &mut input,
        "Allowed sender email(s) (comma-separated): ",
    )?);

    println!("\n--- RECIPIENTS ---");
    let recipients = split_list(&prompt(
        &mut input,
        "BCC recipient email(s) (comma-separated): ",
    )?);

    let prefix = prompt(&mut input, "Subject prefix (optional): ")?;

    let config = Config {
        imap,
        smtp,
        filter: FilterConfig { from },
        recipients,
        subject: SubjectConfig { prefix },
        watch: WatchConfig::default(),
        web: ServerConfig::default(),
    };

    let problems = config.validate();
    if !problems.is_empty() {
        println!("\nThe configuration has problems you may want to fix by hand:");
        problems.iter().for_each(|p| println!("  - {}", p));
    }

    write_config(path, &config)?;
    println!("\n{} created successfully.", path.display());
    Ok(())
}

pub fn write_config(path: &Path, config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("cannot serialize configuration")?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    // Credentials live in this file; it is never readable by others
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(yaml.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    // `mode` only applies to new files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn prompt(input: &mut impl BufRead, label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_port(input: &mut impl BufRead, label: &str, default: u16) -> Result<u16> {
    let raw = prompt(input, label)?;
    if raw.is_empty() {
        return Ok(default);
    }
    raw.parse()
        .with_context(|| format!("{:?} is not a valid port", raw))
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
