use std::path::Path;

use gantry_engine::step::describe_tree;
use gantry_worker::PlacementChain;

use super::{compile, load_plan};

pub fn execute(path: &Path, placement: PlacementChain) -> anyhow::Result<()> {
    let plan = load_plan(path)?;
    let step = compile(&plan, placement)?;
    print!("{}", describe_tree(&step));
    Ok(())
}
