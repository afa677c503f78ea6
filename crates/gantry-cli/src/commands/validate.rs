use std::path::Path;

use gantry_worker::PlacementChain;

use super::{compile, load_plan, node_count};

pub fn execute(path: &Path, placement: PlacementChain) -> anyhow::Result<()> {
    let plan = load_plan(path)?;
    let step = compile(&plan, placement)?;
    println!(
        "plan {} ok: {} nodes",
        path.display(),
        node_count(&step)
    );
    Ok(())
}
