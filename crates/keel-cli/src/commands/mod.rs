pub mod decode;
pub mod gc_plan;
pub mod identity;
pub mod labels;

use std::io::Read;

/// Read a file, or stdin for `-`.
pub(crate) fn read_input(input: &str) -> anyhow::Result<String> {
    if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(input)?)
    }
}
