/// Declare the name of an environment variable as a constant of the same
/// name.
#[macro_export]
macro_rules! env_var {
    ($name:ident) => {
        const $name: &'static str = stringify!($name);
    };
}

/// Load a mandatory environment variable into a validated type.
///
/// The surrounding function must return an `anyhow::Result` and have
/// `anyhow::Context` in scope.
#[macro_export]
macro_rules! env_load {
    ($type:ident, $name:ident) => {
        $type::try_new(
            std::env::var($name)
                .with_context(|| format!("Missing {} env var", $name))?,
        )
        .with_context(|| format!("{} was not formatted right", $name))?
    };
    ($type:ident, $name:ident, $type_raw:ident) => {
        $type::try_new(
            std::env::var($name)
                .with_context(|| format!("Missing {} env var", $name))?
                .parse::<$type_raw>()
                .with_context(|| {
                    format!(
                        "{} env var cannot be parsed in the correct type",
                        $name
                    )
                })?,
        )
        .with_context(|| format!("{} was not formatted right", $name))?
    };
}

/// Same as [`env_load`] with a fallback raw value when the variable is not
/// set. A set but malformed variable is still an error.
#[macro_export]
macro_rules! env_load_or {
    ($type:ident, $name:ident, $type_raw:ident, $default:expr) => {
        $type::try_new(match std::env::var($name) {
            Ok(raw) => raw.parse::<$type_raw>().with_context(|| {
                format!(
                    "{} env var cannot be parsed in the correct type",
                    $name
                )
            })?,
            Err(_) => $default,
        })
        .with_context(|| format!("{} was not formatted right", $name))?
    };
}
