use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use crate::error::LaunchError;

pub const DEFAULT_MAX_PORT_ATTEMPTS: u16 = 200;

fn is_bindable(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    // The probe listener is dropped immediately; this is a check, not a reservation.
    TcpListener::bind(addr).is_ok()
}

/// First loopback port at or above `preferred` that accepts a bind right now.
pub fn find_free_port(preferred: u16, max_attempts: u16) -> Result<u16, LaunchError> {
    let mut candidate = preferred.max(1);
    let mut attempts: u16 = 0;
    while attempts < max_attempts {
        attempts += 1;
        if is_bindable(candidate) {
            if candidate != preferred {
                log::info!("port {preferred} busy, using {candidate}");
            }
            return Ok(candidate);
        }
        let Some(next) = candidate.checked_add(1) else {
            break;
        };
        candidate = next;
    }
    Err(LaunchError::NoFreePort {
        start: preferred,
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn skips_an_occupied_preferred_port() {
        let (_held, busy) = occupied_listener();
        if busy == u16::MAX {
            return;
        }

        let port = find_free_port(busy, DEFAULT_MAX_PORT_ATTEMPTS).unwrap();

        assert!(port > busy);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("returned port must be bindable");
    }

    #[test]
    fn returns_the_preferred_port_when_free() {
        let (listener, port) = occupied_listener();
        drop(listener);

        assert_eq!(find_free_port(port, 1).unwrap(), port);
    }

    #[test]
    fn exhausted_attempts_fail_with_no_free_port() {
        let (_held, busy) = occupied_listener();

        match find_free_port(busy, 1) {
            Err(LaunchError::NoFreePort { start, attempts }) => {
                assert_eq!(start, busy);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected NoFreePort, got {other:?}"),
        }
    }

    #[test]
    fn zero_attempts_never_probes() {
        assert!(matches!(
            find_free_port(3000, 0),
            Err(LaunchError::NoFreePort { attempts: 0, .. })
        ));
    }
}
