use std::{env, ffi::OsString, os::unix::ffi::OsStringExt as _};

use anyhow::{Context, Result, anyhow};
use im::HashMap;
use tokio::process::Command;

pub mod prelude {
    pub use super::{Env, EnvParser, EnvVar};
    pub use crate::utils::misc::OsStringExt;
    pub use crate::{define_env, env_parser_auto, env_parser_raw};
}

pub trait EnvVar {
    const KEY: &str;
}

pub trait EnvParser: Sized {
    fn serialize(&self) -> OsString;
    fn deserialize(value: OsString) -> Result<Self>;
}

#[macro_export]
macro_rules! define_env {
    ($key:expr, $vis:vis $struct_name:ident($inner:ty)) => {
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $struct_name(pub $inner);

        impl $crate::environment::EnvVar for $struct_name {
            const KEY: &str = $key;
        }

        impl std::ops::Deref for $struct_name {
            type Target = $inner;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

/// Values that round-trip through `Display` and `FromStr`
#[macro_export]
macro_rules! env_parser_auto {
    ($struct_name:ident) => {
        impl $crate::environment::EnvParser for $struct_name {
            #[inline]
            fn serialize(&self) -> std::ffi::OsString {
                self.0.to_string().into()
            }

            #[inline]
            fn deserialize(value: std::ffi::OsString) -> anyhow::Result<Self> {
                use $crate::utils::misc::OsStringExt;
                Ok(Self(value.try_to_string()?.parse()?))
            }
        }
    };
}

/// Values that are stored as-is, without requiring valid unicode
#[macro_export]
macro_rules! env_parser_raw {
    ($struct_name:ident) => {
        impl $crate::environment::EnvParser for $struct_name {
            #[inline]
            fn serialize(&self) -> std::ffi::OsString {
                self.0.clone().into()
            }

            #[inline]
            fn deserialize(value: std::ffi::OsString) -> anyhow::Result<Self> {
                Ok(Self(value.into()))
            }
        }
    };
}

#[derive(Clone, Debug, Default)]
pub struct Env {
    state: HashMap<String, OsString>,
}

pub fn current() -> Env {
    Env::from_values(
        env::vars_os()
            // Note: ignore all variables with non-unicode keys
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v))),
    )
}

impl Env {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, OsString)>) -> Self {
        Self {
            state: values.into_iter().collect(),
        }
    }

    pub fn peek<E: EnvVar + EnvParser>(&self) -> Result<E> {
        let value = self
            .state
            .get(E::KEY)
            .ok_or(anyhow!("Variable {} does not exist", E::KEY))?;

        E::deserialize(value.clone())
            .with_context(|| format!("Variable {} exists, but contents are invalid", E::KEY))
    }

    pub fn pull<E: EnvVar + EnvParser>(&mut self) -> Result<E> {
        let (value, state) = self
            .state
            .extract(E::KEY)
            .ok_or(anyhow!("Variable {} does not exist", E::KEY))?;

        self.state = state;

        E::deserialize(value)
            .with_context(|| format!("Variable {} exists, but contents are invalid", E::KEY))
    }

    pub fn get_raw(&self, key: &str) -> Option<&OsString> {
        self.state.get(key)
    }

    pub fn set_raw(self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        Self {
            state: self.state.update(key.into(), value.into()),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    // In the simplest case of one variable, set == bind
    // For N variables set == N binds
    fn bind<E: EnvVar + EnvParser>(self, var: E) -> Self {
        self.set_raw(E::KEY, var.serialize())
    }

    pub fn set<C: EnvContainer>(self, container: C) -> Self {
        container.apply_as_container(self)
    }

    /// Values from `other` replace values already present
    pub fn merge(self, other: impl EnvContainer) -> Self {
        other.apply_as_container(self)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OsString)> {
        self.state.iter()
    }

    /// `KEY=VALUE` pairs, as expected by C APIs
    pub fn to_vec(&self) -> Vec<OsString> {
        self.state
            .iter()
            .map(|(key, value)| {
                let mut pair = format!("{key}=").into_bytes();
                pair.extend_from_slice(value.clone().into_vec().as_slice());
                OsString::from_vec(pair)
            })
            .collect()
    }
}

pub trait EnvRecipient {
    fn set_env(&mut self, env: Env) -> &mut Self;
}

impl EnvRecipient for Command {
    fn set_env(&mut self, env: Env) -> &mut Self {
        self.env_clear().envs(env.state);
        self
    }
}

pub trait EnvContainer {
    fn apply_as_container(self, env: Env) -> Env;
}

macro_rules! variadic_env_impl {
    ( $( $name:ident )+ ) => {
        #[allow(non_camel_case_types)]
        impl<$($name: EnvVar + EnvParser),+> EnvContainer for ($($name,)+)
        {
            fn apply_as_container(self, env: Env) -> Env {
                let ($($name,)+) = self;
                $(let env = env.bind($name);)+
                env
            }
        }
    };
}

variadic_env_impl! { a b }
variadic_env_impl! { a b c }
variadic_env_impl! { a b c d }
variadic_env_impl! { a b c d e }
variadic_env_impl! { a b c d e f }
variadic_env_impl! { a b c d e f g }
variadic_env_impl! { a b c d e f g h }

impl<T: EnvVar + EnvParser> EnvContainer for T {
    fn apply_as_container(self, env: Env) -> Env {
        env.bind(self)
    }
}

impl EnvContainer for Env {
    fn apply_as_container(self, env: Env) -> Env {
        // union() keeps whichever map is larger on conflict, so insert one by one
        Env {
            state: self
                .state
                .into_iter()
                .fold(env.state, |state, (key, value)| state.update(key, value)),
        }
    }
}
