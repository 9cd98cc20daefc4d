use lazy_static::lazy_static;
use tracing::warn;

lazy_static! {
    static ref HOSTNAME: String = read_hostname();
}

fn read_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().to_string(),
        Err(err) => {
            warn!("gethostname failed with {}, falling back to localhost", err);
            "localhost".to_string()
        }
    }
}

/// Host name recorded in every data header. Read once per process.
pub fn hostname() -> &'static str {
    HOSTNAME.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_matches_the_system() {
        let expected = nix::unistd::gethostname().unwrap();
        assert_eq!(hostname(), expected.to_string_lossy());
    }

    #[test]
    fn test_hostname_is_stable() {
        assert!(!hostname().is_empty());
        assert_eq!(hostname(), hostname());
    }
}
