use clap::{Parser, Subcommand};

/// ISolar Bridge - a bridge for EASUN ISolar inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    #[clap(subcommand)]
    pub command: Option<RunCommand>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum RunCommand {
    /// Poll the inverter on an interval and publish readings (default)
    Monitor,

    /// Sweep a register range and dump raw words, mapped or not
    RegisterScan {
        #[clap(long, default_value_t = 0)]
        start_register: u16,

        #[clap(long, default_value_t = 100)]
        register_count: u16,
    },

    /// Probe device ids to find which one the inverter answers to
    DeviceScan {
        #[clap(long, default_value_t = 0)]
        start_id: u8,

        #[clap(long, default_value_t = 255)]
        end_id: u8,
    },
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}
