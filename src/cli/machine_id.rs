//! Machine identifier command.

use clap::Args;
use vmhost::machine_id::{EcidGenerator, MachineIdGenerator};

/// Print a freshly generated machine identifier.
#[derive(Args, Debug)]
pub struct MachineIdCmd {
    /// Plist conversion tool. Platform default when unset.
    #[arg(long)]
    converter: Option<String>,
}

impl MachineIdCmd {
    /// Execute the machine-id command.
    pub fn run(&self) -> vmhost::Result<()> {
        let generator = match &self.converter {
            Some(program) => EcidGenerator::with_converter(program.clone(), Vec::<String>::new()),
            None => EcidGenerator::default(),
        };
        println!("{}", generator.generate()?);
        Ok(())
    }
}
