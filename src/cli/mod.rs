mod args;

pub use args::Cli;

use color_eyre::eyre::Result;

/// Asks the user to confirm the deletion. Only the literal answer `YES` is
/// accepted; `force` skips the prompt entirely.
pub fn user_confirmed_deletion(force: bool) -> Result<bool> {
    if force {
        return Ok(true);
    }

    let answer: String = dialoguer::Input::new()
        .with_prompt(
            "Are you sure you want to delete these resources (cannot be undone)? \
             Only YES will be accepted",
        )
        .allow_empty(true)
        .interact_text()?;

    Ok(answer.trim() == "YES")
}
