//! Hostlist expressions such as `tux[2,5,12-16],login1`.
use crate::error::invalid_input;

/// Expands a hostlist expression into individual host names, preserving order.
pub fn expand(expression: &str) -> crate::Result<Vec<String>> {
    let mut hosts = Vec::new();
    for item in split_top_level(expression)? {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.find('[') {
            None => {
                if item.contains(']') {
                    return invalid_input(format!("unbalanced bracket in hostlist `{item}`"));
                }
                hosts.push(item.to_string());
            }
            Some(open) => {
                let Some(close) = item.rfind(']') else {
                    return invalid_input(format!("unbalanced bracket in hostlist `{item}`"));
                };
                let prefix = &item[..open];
                let suffix = &item[close + 1..];
                for range in item[open + 1..close].split(',') {
                    expand_range(prefix, range.trim(), suffix, &mut hosts)?;
                }
            }
        }
    }
    Ok(hosts)
}

fn split_top_level(expression: &str) -> crate::Result<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (position, c) in expression.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                if depth == 0 {
                    return invalid_input(format!("unbalanced bracket in hostlist `{expression}`"));
                }
                depth -= 1;
            }
            ',' if depth == 0 => {
                items.push(&expression[start..position]);
                start = position + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return invalid_input(format!("unbalanced bracket in hostlist `{expression}`"));
    }
    items.push(&expression[start..]);
    Ok(items)
}

fn expand_range(
    prefix: &str,
    range: &str,
    suffix: &str,
    hosts: &mut Vec<String>,
) -> crate::Result<()> {
    let (low, high) = match range.split_once('-') {
        Some((low, high)) => (low, high),
        None => (range, range),
    };
    let parse = |value: &str| {
        value
            .parse::<u64>()
            .map_err(|_| crate::Error::InvalidInput(format!("invalid hostlist range `{range}`")))
    };
    let (start, end) = (parse(low)?, parse(high)?);
    if start > end {
        return invalid_input(format!("descending hostlist range `{range}`"));
    }
    let width = if low.len() > 1 && low.starts_with('0') {
        low.len()
    } else {
        0
    };
    for number in start..=end {
        hosts.push(format!("{prefix}{number:0width$}{suffix}"));
    }
    Ok(())
}

/// Splits a host name into its prefix and trailing number (with its zero padding width).
fn split_numeric_suffix(name: &str) -> Option<(&str, u64, usize)> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let (prefix, number) = name.split_at(name.len() - digits);
    let width = if number.len() > 1 && number.starts_with('0') {
        number.len()
    } else {
        0
    };
    Some((prefix, number.parse().ok()?, width))
}

/// Builds the shortest expression of the given names, keeping their order.
///
/// Consecutive names sharing a prefix are bracketed and consecutive numbers collapse into ranges.
pub fn compress<S: AsRef<str>>(names: &[S]) -> String {
    struct Group<'a> {
        prefix: &'a str,
        width: usize,
        numbers: Vec<u64>,
    }

    let mut items: Vec<String> = Vec::new();
    let mut group: Option<Group> = None;

    let flush = |group: &mut Option<Group>, items: &mut Vec<String>| {
        if let Some(group) = group.take() {
            items.push(format_group(group.prefix, group.width, &group.numbers));
        }
    };

    for name in names {
        let name = name.as_ref();
        match split_numeric_suffix(name) {
            Some((prefix, number, width)) => {
                if let Some(current) = group.as_mut() {
                    if current.prefix == prefix && current.width == width {
                        current.numbers.push(number);
                        continue;
                    }
                }
                flush(&mut group, &mut items);
                group = Some(Group {
                    prefix,
                    width,
                    numbers: vec![number],
                });
            }
            None => {
                flush(&mut group, &mut items);
                items.push(name.to_string());
            }
        }
    }
    flush(&mut group, &mut items);
    items.join(",")
}

fn format_group(prefix: &str, width: usize, numbers: &[u64]) -> String {
    if numbers.len() == 1 {
        return format!("{prefix}{:0width$}", numbers[0]);
    }
    let mut ranges: Vec<String> = Vec::new();
    let mut index = 0;
    while index < numbers.len() {
        let start = numbers[index];
        let mut end = start;
        while index + 1 < numbers.len() && numbers[index + 1] == end + 1 {
            end += 1;
            index += 1;
        }
        if start == end {
            ranges.push(format!("{start:0width$}"));
        } else {
            ranges.push(format!("{start:0width$}-{end:0width$}"));
        }
        index += 1;
    }
    format!("{prefix}[{}]", ranges.join(","))
}
