//! MAP file output (§4.4, §6): one file per image, written once at
//! preprocessor shutdown from the accumulated MAP-entry request sets.

use std::io::Write;
use std::path::Path;

use dashmap::DashMap;

use crate::format::ImageTable;

pub fn write_map_files(
    output_dir: &Path,
    images: &ImageTable,
    entries: &DashMap<i32, DashMap<u32, String>>,
) -> std::io::Result<()> {
    for image in images.images() {
        let Some(requested) = entries.get(&image.id) else {
            continue;
        };
        let mut rows: Vec<(u32, String)> = requested.iter().map(|r| (*r.key(), r.value().clone())).collect();
        rows.sort_by_key(|(addr, _)| *addr);

        let path = output_dir.join(format!("{}.map", sanitize(&image.name)));
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", image.name)?;
        for (addr, name) in rows {
            writeln!(file, "{addr:#x}\t{name}")?;
        }
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
