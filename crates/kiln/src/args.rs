/// Parameter names for a compiled function, in order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgList {
    names: Vec<String>,
}

impl ArgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<const N: usize> From<[&str; N]> for ArgList {
    fn from(names: [&str; N]) -> Self {
        ArgList {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl From<&[&str]> for ArgList {
    fn from(names: &[&str]) -> Self {
        ArgList {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}
