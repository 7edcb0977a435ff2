use clap::ValueEnum;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectMode {
    /// Restart the download at the new location without asking
    Follow,
    /// Fail the download on any redirect
    Refuse,
    /// Ask on the terminal before restarting
    Ask,
}

impl RedirectMode {
    /// Ask when someone can answer, follow otherwise.
    pub fn default_for(interactive: bool) -> Self {
        if interactive {
            Self::Ask
        } else {
            Self::Follow
        }
    }
}
