//! Helpers for the structural dump (`describe`) surface. Every dump
//! writes lines indented by a caller-supplied depth so nested components
//! compose.

use crate::res::{Res, ResErr};
use std::fmt::{self, Write};

pub(crate) fn write_line(w: &mut dyn Write, depth: usize, args: fmt::Arguments<'_>) -> Res<()> {
    let put = |w: &mut dyn Write| -> fmt::Result {
        for _ in 0..depth {
            w.write_char(' ')?;
        }
        w.write_fmt(args)?;
        w.write_char('\n')
    };
    put(w).map_err(|_| ResErr::Io)
}

macro_rules! wline {
    ($w:expr, $depth:expr, $($arg:tt)*) => {
        crate::describe::write_line($w, $depth, format_args!($($arg)*))
    };
}

pub(crate) use wline;

#[cfg(test)]
mod tests {
    #[test]
    fn indents_by_depth() {
        let mut out = String::new();
        wline!(&mut out, 4, "limit {:#x}", 0x1000usize).unwrap();
        assert_eq!(out, "    limit 0x1000\n");
    }
}
