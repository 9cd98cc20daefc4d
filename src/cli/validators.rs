use std::ops::RangeInclusive;
use std::time::Duration;

const THREADS_RANGE: RangeInclusive<usize> = 1..=256;

pub(crate) fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

pub(crate) fn threads_in_range(s: &str) -> Result<usize, String> {
    let threads: usize = s
        .parse()
        .map_err(|_| format!("`{s}' isn't a valid number of threads"))?;
    if !THREADS_RANGE.contains(&threads) {
        return Err(format!(
            "number of threads not in allowed range {}-{}",
            THREADS_RANGE.start(),
            THREADS_RANGE.end()
        ));
    }
    Ok(threads)
}
