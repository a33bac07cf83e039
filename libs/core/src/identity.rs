use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stream::BasicStream;

/// Request context: free-form key/value pairs sent with every request
pub type Context = BTreeMap<String, String>;

/// Name and category of a target object
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    pub fn write(&self, os: &mut BasicStream) {
        os.write_string(&self.name);
        os.write_string(&self.category);
    }

    pub fn read(is: &mut BasicStream) -> Result<Self> {
        let name = is.read_string()?;
        let category = is.read_string()?;
        Ok(Self { name, category })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

pub fn write_context(os: &mut BasicStream, context: &Context) {
    os.write_size(context.len());
    for (key, value) in context {
        os.write_string(key);
        os.write_string(value);
    }
}

pub fn read_context(is: &mut BasicStream) -> Result<Context> {
    let len = is.read_size()?;
    let mut context = Context::new();
    for _ in 0..len {
        let key = is.read_string()?;
        let value = is.read_string()?;
        context.insert(key, value);
    }
    Ok(context)
}
