use keystash_core::{StorageError, StorageKey};

use crate::cell::Storable;

/// Declares a stored value at the type level: its key, value type and
/// default.
///
/// ```
/// use keystash_observe::KeyDefinition;
///
/// struct AccessToken;
///
/// impl KeyDefinition for AccessToken {
///     type Value = Option<String>;
///
///     fn default_value() -> Self::Value {
///         None
///     }
/// }
///
/// assert_eq!(AccessToken::name(), "AccessToken");
/// ```
pub trait KeyDefinition {
    type Value: Storable;

    /// Key name; defaults to the implementing type's name without its path
    /// or generic arguments, so `Wrapper<a::B>` becomes `"Wrapper"`.
    /// Override it when instantiations of one generic type need distinct keys.
    fn name() -> &'static str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    fn default_value() -> Self::Value;

    fn storage_key() -> Result<StorageKey, StorageError> {
        StorageKey::new(Self::name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Theme;

    impl KeyDefinition for Theme {
        type Value = String;

        fn default_value() -> Self::Value {
            "light".to_string()
        }
    }

    struct Renamed;

    impl KeyDefinition for Renamed {
        type Value = u8;

        fn name() -> &'static str {
            "settings/volume"
        }

        fn default_value() -> Self::Value {
            5
        }
    }

    struct Wrapper<T>(std::marker::PhantomData<T>);

    impl<T> KeyDefinition for Wrapper<T> {
        type Value = bool;

        fn default_value() -> Self::Value {
            false
        }
    }

    #[test]
    fn default_name_drops_generic_arguments() {
        assert_eq!(Wrapper::<Theme>::name(), "Wrapper");
        assert_eq!(Wrapper::<Vec<String>>::name(), "Wrapper");
    }

    #[test]
    fn default_name_is_type_name() {
        assert_eq!(Theme::name(), "Theme");
        assert_eq!(Theme::storage_key().unwrap().as_str(), "Theme");
    }

    #[test]
    fn name_can_be_overridden() {
        assert_eq!(Renamed::storage_key().unwrap().as_str(), "settings/volume");
    }
}
