use std::fmt;

/// Per-thread counters, reachable from emitted code through the
/// frame's telemetry pointer.
#[repr(C)]
#[derive(Default, Debug)]
pub struct Telemetry {
    pub blocks_compiled: u64,
    pub l1_misses: u64,
    pub secondary_hits: u64,
    pub links_installed: u64,
    pub cache_clears: u64,
    pub signals_classified: u64,
}

impl fmt::Display for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== DBT thread stats ===")?;
        writeln!(f, "blocks compiled:  {}", self.blocks_compiled)?;
        writeln!(f, "l1 misses:        {}", self.l1_misses)?;
        writeln!(f, "secondary hits:   {}", self.secondary_hits)?;
        writeln!(f, "links installed:  {}", self.links_installed)?;
        writeln!(f, "cache clears:     {}", self.cache_clears)?;
        writeln!(f, "signals handled:  {}", self.signals_classified)?;
        Ok(())
    }
}
