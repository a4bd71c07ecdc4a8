use crate::apiserver::GenericServerConfig;
use crate::{Error, Result};
use clap::{ArgAction, Args};

#[derive(Args, Clone, Debug)]
pub struct FeatureOptions {
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Enable runtime profiling via /debug/runtime"
    )]
    pub profiling: bool,

    #[arg(
        long,
        help = "Also report scheduler queue contention when profiling is enabled"
    )]
    pub contention_profiling: bool,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            profiling: true,
            contention_profiling: false,
        }
    }
}

impl FeatureOptions {
    pub fn apply_to(&self, config: &mut GenericServerConfig) -> Result<()> {
        if self.contention_profiling && !self.profiling {
            return Err(Error::Features(
                "--contention-profiling requires --profiling".to_string(),
            ));
        }

        config.enable_profiling = self.profiling;
        config.enable_contention_profiling = self.contention_profiling;
        Ok(())
    }
}
