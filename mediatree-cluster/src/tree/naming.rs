/// Smallest free `{prefix}-{n}` with `n >= 1`
///
/// Only ids made of the prefix, a dash and a decimal suffix count as taken,
/// so `relay-root-2` never occupies a `relay` slot.
pub fn next_node_id<'a>(prefix: &str, taken: impl IntoIterator<Item = &'a str>) -> String {
    let mut suffixes: Vec<u64> = taken
        .into_iter()
        .filter_map(|id| id.strip_prefix(prefix)?.strip_prefix('-'))
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse().ok())
        .collect();
    suffixes.sort_unstable();
    suffixes.dedup();

    let mut next = 1;
    for suffix in suffixes {
        if suffix == next {
            next += 1;
        } else if suffix > next {
            break;
        }
    }
    format!("{prefix}-{next}")
}
