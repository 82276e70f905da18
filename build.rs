//! Generates `attack-range(1)` and one page per subcommand, such as
//! `attack-range-dump(1)`, into the build output directory.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn render(command: clap::Command, target: &Path) -> io::Result<()> {
    let mut page = Vec::new();
    Man::new(command).render(&mut page)?;
    fs::write(target, page)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let root = cli::Cli::command();
    for sub in root.get_subcommands() {
        let name = format!("attack-range-{}", sub.get_name());
        let page = sub.clone().name(name.clone());
        render(page, &out_dir.join(format!("{name}.1")))?;
    }
    render(root, &out_dir.join("attack-range.1"))?;
    Ok(())
}
