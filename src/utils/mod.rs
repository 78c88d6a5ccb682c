use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Keyboard-interactive prompt handler that always responds with the password
struct PasswordPrompt {
    password: String,
}

impl ssh2::KeyboardInteractivePrompt for PasswordPrompt {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.clone()).collect()
    }
}

/// Seconds to the millisecond timeout libssh2 takes, saturating at `u32::MAX`
pub fn timeout_ms(secs: u64) -> u32 {
    u32::try_from(secs.saturating_mul(1000)).unwrap_or(u32::MAX)
}

/// Validate an IPv4 address (e.g., "192.168.1.1").
/// Returns true if the string is a valid dotted-decimal IPv4 address.
pub fn is_valid_ipv4(ip: &str) -> bool {
    let parts: Vec<&str> = ip.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| p.parse::<u8>().is_ok())
}

/// Validate a hostname.
/// Allows alphanumeric, hyphens, dots, and underscores. No path separators or shell metacharacters.
pub fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Validate a management host: hostname, IPv4 or IPv6 literal
pub fn is_valid_host(host: &str) -> bool {
    is_valid_ipv4(host) || host.parse::<IpAddr>().is_ok() || is_valid_hostname(host)
}

/// Create an SSH session and authenticate with password + keyboard-interactive.
/// Returns the authenticated Session. Blocking; call from spawn_blocking.
pub fn ssh_connect(
    host: &str,
    port: u16,
    user: &str,
    pass: &str,
    timeout_secs: u64,
) -> Result<ssh2::Session, String> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Invalid address {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| format!("{}:{} did not resolve", host, port))?;
    let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(timeout_secs))
        .map_err(|e| format!("TCP connection failed: {}", e))?;

    tcp.set_read_timeout(Some(Duration::from_secs(timeout_secs)))
        .ok();
    tcp.set_write_timeout(Some(Duration::from_secs(timeout_secs)))
        .ok();

    let mut session =
        ssh2::Session::new().map_err(|e| format!("Failed to create SSH session: {}", e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(timeout_secs));
    session
        .handshake()
        .map_err(|e| format!("SSH handshake failed: {}", e))?;

    match session.userauth_password(user, pass) {
        Ok(_) if session.authenticated() => return Ok(session),
        _ => {}
    }

    // VyOS images built with PAM/RADIUS only offer keyboard-interactive
    let mut prompter = PasswordPrompt {
        password: pass.to_string(),
    };
    let _ = session.userauth_keyboard_interactive(user, &mut prompter);

    if session.authenticated() {
        Ok(session)
    } else {
        Err("SSH authentication failed: all methods exhausted".to_string())
    }
}

/// Truncate output to a maximum number of lines
pub fn truncate_lines(s: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= max_lines {
        s.to_string()
    } else {
        let truncated: Vec<&str> = lines[..max_lines].to_vec();
        format!(
            "{}\n... ({} more lines)",
            truncated.join("\n"),
            lines.len() - max_lines
        )
    }
}
