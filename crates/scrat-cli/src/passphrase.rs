use zeroize::Zeroizing;

/// Resolve the backup passphrase: `SCRAT_PASSPHRASE` wins, an interactive
/// prompt otherwise.
pub fn get_passphrase() -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    if let Ok(pass) = std::env::var("SCRAT_PASSPHRASE") {
        if !pass.is_empty() {
            return Ok(Zeroizing::new(pass));
        }
    }
    let pass = rpassword::prompt_password("Enter passphrase: ")?;
    Ok(Zeroizing::new(pass))
}
