pub mod diff;
pub mod import;
pub mod info;
pub mod patch;

use rd5::RegionStoreBuilder;

/// Region store settings from the environment, overridden by the flag.
pub fn store_builder(section_cache_size: Option<u64>) -> RegionStoreBuilder {
    let builder = RegionStoreBuilder::from_env();
    match section_cache_size {
        Some(size) => builder.section_cache_size(size),
        None => builder,
    }
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
