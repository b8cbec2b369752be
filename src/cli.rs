use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "xremap", version, about = "Global key remapper for X11")]
pub struct Cli {
    /// X display to connect to (defaults to $DISPLAY)
    #[arg(long, value_name = "DISPLAY")]
    pub display: Option<String>,

    /// Rule file, or - to read it from stdin
    #[arg(value_name = "CONFIG")]
    pub config: String,
}
