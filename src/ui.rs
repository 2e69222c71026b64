// UI layer: terminal glue for the CLI. Prompts use `dialoguer`, transfers
// show an `indicatif` progress bar and the listing header is styled with
// `crossterm`. Everything here is synchronous and returns `anyhow::Result`.

use crate::client::{Boox, SendReport};
use crate::config::Config;
use crate::listing::{table_row, FileListing, TABLE_HEADER, TABLE_RULE};
use anyhow::{bail, Context, Result};
use crossterm::style::Stylize;
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// A spinner with a message, ticking on its own.
pub fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

/// Ask for the account email, offering `default` when known.
pub fn prompt_email(default: Option<&str>) -> Result<String> {
    let mut input = Input::<String>::new();
    input.with_prompt("Email");
    if let Some(default) = default {
        input.default(default.to_string());
    }
    Ok(input.interact_text()?)
}

/// Ask for the one-time verification code that was mailed to the user.
pub fn prompt_code() -> Result<String> {
    let code: String = Input::new()
        .with_prompt("Verification code")
        .validate_with(|input: &String| -> std::result::Result<(), &str> {
            if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
                Ok(())
            } else {
                Err("the code is a number")
            }
        })
        .interact_text()?;
    Ok(code)
}

/// Log in with email and code, asking for whatever is missing. Returns
/// the new token and leaves it (and the email) on `config`.
pub fn login(config: &mut Config, email: Option<String>, code: Option<String>) -> Result<String> {
    let email = match email.or_else(|| config.email.clone()) {
        Some(email) => email,
        None => prompt_email(None)?,
    };

    let code = match code {
        Some(code) => code,
        None => {
            let pb = spinner("Requesting a verification code...")?;
            let sent = Boox::request_verification_code(config, &email);
            pb.finish_and_clear();
            sent.with_context(|| format!("could not request a code for {}", email))?;
            println!("A verification code was sent to {}.", email);
            prompt_code()?
        }
    };

    let pb = spinner("Logging in...")?;
    let token = Boox::login(config, &email, &code);
    pb.finish_and_clear();
    let token = token.context("login failed")?;

    config.email = Some(email);
    config.token = Some(token.clone());
    Ok(token)
}

/// Write the config, including a freshly obtained token, to `path`.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    config
        .save(path)
        .with_context(|| format!("could not write {}", path.display()))?;
    println!("Saved credentials to {}", path.display());
    Ok(())
}

/// Ask before saving a token unless `save` already says so.
pub fn maybe_save_config(config: &Config, path: &Path, save: bool) -> Result<()> {
    let save = save
        || Confirm::new()
            .with_prompt(format!("Save the token to {}?", path.display()))
            .default(true)
            .interact()?;
    if save {
        save_config(config, path)?;
    }
    Ok(())
}

/// Open a session, logging in interactively when no token is configured.
pub fn connect(config: &mut Config, code: Option<String>) -> Result<Boox> {
    if config.token().is_none() {
        if code.is_none() && config.email.is_none() {
            bail!("no token configured; run `send2boox login` first");
        }
        login(config, None, code)?;
    }

    let pb = spinner("Connecting...")?;
    let boox = Boox::connect(config.clone(), None);
    pb.finish_and_clear();
    boox.with_context(|| format!("could not open a session on {}", config.cloud))
}

/// Send `path` with a byte progress bar.
pub fn send_file(boox: &mut Boox, path: &Path) -> Result<SendReport> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
        )?
        .progress_chars("=> "),
    );
    bar.set_message(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let result = boox.send_file(path, &mut |done, total| {
        bar.set_length(total);
        bar.set_position(done);
    });
    bar.finish_and_clear();

    let report = result.with_context(|| {
        format!("sending {} stopped after: {}", path.display(), boox.state())
    })?;
    println!(
        "Registered {} as document {} ({})",
        path.display(),
        report.document.document_id,
        report.document.current_revision
    );
    Ok(report)
}

/// Print the listing as a table with a bold header.
pub fn print_listing(listing: &FileListing) {
    println!("{}", TABLE_HEADER.bold());
    println!("{}", TABLE_RULE);
    for entry in listing.iter() {
        println!("{}", table_row(entry));
    }
}

/// Confirm deleting `ids` unless `yes` was given.
pub fn confirm_delete(ids: &[String], yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(format!("Delete {} file(s)?", ids.len()))
        .default(false)
        .interact()?)
}
