use std::fs;

use eyre::eyre;

use crate::scanner::targets::{Ipv4Ranges, parse_range};

pub fn parse_file(path: &str) -> eyre::Result<Ipv4Ranges> {
    let input = fs::read_to_string(path)?;

    parse(&input)
}

/// Parse an exclude file. Every non-empty line is a range in any of the forms
/// accepted by [`parse_range`], and everything after a `#` is ignored.
pub fn parse(input: &str) -> eyre::Result<Ipv4Ranges> {
    let mut ranges = Vec::new();

    for (line_number, line) in input.lines().enumerate() {
        // remove everything after the first #
        let line = line.split('#').next().unwrap_or_default().trim();

        if line.is_empty() {
            continue;
        }

        let range = parse_range(line)
            .map_err(|e| eyre!("Invalid exclude range on line {}: {e}", line_number + 1))?;
        ranges.push(range);
    }

    Ok(Ipv4Ranges::new(ranges))
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::scanner::targets::Ipv4Range;

    #[test]
    fn test_parse_exclude_file() {
        let ranges = parse(
            "
            # reserved
            0.0.0.0/8
            10.0.0.0/8 # private
            192.168.0.1-192.168.0.10

            1.1.1.1
            ",
        )
        .unwrap();

        assert_eq!(ranges.ranges().len(), 4);
        assert_eq!(ranges.count(), (1 << 24) * 2 + 10 + 1);
        assert_eq!(
            ranges.ranges(),
            &vec![
                Ipv4Range {
                    start: Ipv4Addr::new(0, 0, 0, 0),
                    end: Ipv4Addr::new(0, 255, 255, 255),
                },
                Ipv4Range::single(Ipv4Addr::new(1, 1, 1, 1)),
                Ipv4Range {
                    start: Ipv4Addr::new(10, 0, 0, 0),
                    end: Ipv4Addr::new(10, 255, 255, 255),
                },
                Ipv4Range {
                    start: Ipv4Addr::new(192, 168, 0, 1),
                    end: Ipv4Addr::new(192, 168, 0, 10),
                },
            ]
        );
    }

    #[test]
    fn test_invalid_line_reports_line_number() {
        let err = parse("10.0.0.0/8\n10.0.0.0/99\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
