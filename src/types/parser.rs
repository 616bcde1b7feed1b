//! Signature text parser.
//!
//! The grammar is prefix-only, so every compound can be parsed by looking at
//! its first character and then locating the end of each child with
//! [`next_arg_end`], a depth-tracking scan that stops at the first space
//! outside any brackets.

use crate::error::{InteropError, InteropResult};
use crate::types::{CallConv, Field, FunctionSig, Prim, SigKind, StringKind, TypeSig};

/// Length of the first space-delimited argument in `s`, skipping spaces
/// nested inside `[]`, `{}` or `()`.
pub fn next_arg_end(s: &str) -> usize {
    let mut depth = 0usize;
    for (i, b) in s.bytes().enumerate() {
        match b {
            b'[' | b'{' | b'(' => depth += 1,
            b']' | b'}' | b')' => depth = depth.saturating_sub(1),
            b' ' if depth == 0 => return i,
            _ => {}
        }
    }
    s.len()
}

/// Parse one complete signature.
pub fn parse_signature(text: &str) -> InteropResult<TypeSig> {
    let start = text.len() - text.trim_start().len();
    let end = text.trim_end().len();
    if start >= end {
        return Err(InteropError::signature(text, 0, "empty signature"));
    }
    let cx = ParseCx { text };
    let end_of_first = start + next_arg_end(&text[start..end]);
    if end_of_first != end {
        return Err(cx.error(end_of_first, "unexpected text after type"));
    }
    cx.parse_one(start, end)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

struct ParseCx<'a> {
    text: &'a str,
}

impl<'a> ParseCx<'a> {
    fn error(&self, offset: usize, message: impl Into<String>) -> InteropError {
        InteropError::signature(self.text, offset, message)
    }

    /// Parse the type that occupies exactly `text[start..end]`.
    fn parse_one(&self, start: usize, end: usize) -> InteropResult<TypeSig> {
        let s = &self.text[start..end];
        let bytes = s.as_bytes();
        let Some(&first) = bytes.first() else {
            return Err(self.error(start, "expected a type"));
        };

        let kind = match first {
            b'%' => {
                let mut inner = self.parse_one(start + 1, end)?;
                inner.is_const = true;
                return Ok(inner);
            }
            b'*' => SigKind::Pointer(Box::new(self.parse_one(start + 1, end)?)),
            b'&' => {
                let target = self.parse_one(start + 1, end)?;
                if target.is_void() {
                    return Err(self.error(start, "reference to void"));
                }
                SigKind::Reference(Box::new(target))
            }
            b'[' => self.parse_array(start, end)?,
            b'{' => self.parse_compound(start, end)?,
            b'(' => self.parse_function(start, end)?,
            b'@' => {
                let name = &s[1..];
                if name.is_empty() || !name.bytes().all(is_ident_byte) {
                    return Err(self.error(start + 1, "invalid type name"));
                }
                SigKind::Named(name.to_string())
            }
            b'E' => {
                // Optional enum tag name, informational only.
                if !bytes[1..].iter().all(|&b| is_ident_byte(b)) {
                    return Err(self.error(start + 1, "invalid enum name"));
                }
                SigKind::Prim(Prim::Enum)
            }
            b't' | b'T' if bytes.len() == 1 => SigKind::String(if first == b't' {
                StringKind::Ansi
            } else {
                StringKind::Wide
            }),
            c => {
                let prim = Prim::from_code(c as char).ok_or_else(|| {
                    self.error(start, format!("unknown type code '{}'", c as char))
                })?;
                if bytes.len() > 1 {
                    return Err(self.error(start + 1, "unexpected text after type"));
                }
                SigKind::Prim(prim)
            }
        };
        Ok(TypeSig::new(kind))
    }

    fn parse_array(&self, start: usize, end: usize) -> InteropResult<SigKind> {
        let s = &self.text[start..end];
        let close = s
            .find(']')
            .ok_or_else(|| self.error(start, "unterminated array dimension"))?;
        let dim = &s[1..close];
        let len = if dim.is_empty() {
            None
        } else {
            let n: usize = dim
                .parse()
                .map_err(|_| self.error(start + 1, format!("invalid array dimension '{}'", dim)))?;
            if n == 0 {
                return Err(self.error(start + 1, "zero-length array"));
            }
            Some(n)
        };
        let elem = self.parse_one(start + close + 1, end)?;
        if elem.is_void() {
            return Err(self.error(start + close + 1, "array of void"));
        }
        Ok(SigKind::Array {
            len,
            elem: Box::new(elem),
        })
    }

    fn parse_compound(&self, start: usize, end: usize) -> InteropResult<SigKind> {
        let s = &self.text[start..end];
        if s.len() < 3 || !s.ends_with('}') {
            return Err(self.error(start, "unbalanced '{'"));
        }
        let is_struct = match s.as_bytes()[1] {
            b'S' => true,
            b'U' => false,
            _ => return Err(self.error(start + 1, "expected 'S' or 'U' after '{'")),
        };

        let mut fields = Vec::new();
        for (a, b) in self.split_items(start + 2, end - 1) {
            fields.push(self.parse_field(a, b)?);
        }
        if fields.is_empty() {
            return Err(self.error(start, "struct or union has no members"));
        }
        Ok(if is_struct {
            SigKind::Struct(fields)
        } else {
            SigKind::Union(fields)
        })
    }

    fn parse_field(&self, start: usize, end: usize) -> InteropResult<Field> {
        let s = &self.text[start..end];
        let ident_len = s.bytes().take_while(|&b| is_ident_byte(b)).count();
        let (name, type_start) = if ident_len > 0 && s.as_bytes().get(ident_len) == Some(&b':') {
            (Some(s[..ident_len].to_string()), start + ident_len + 1)
        } else {
            (None, start)
        };
        let ty = self.parse_one(type_start, end)?;
        if ty.is_void() {
            return Err(self.error(type_start, "void member"));
        }
        if matches!(ty.kind, SigKind::Function(_)) {
            return Err(self.error(type_start, "function member must be a pointer"));
        }
        Ok(Field { name, ty })
    }

    fn parse_function(&self, start: usize, end: usize) -> InteropResult<SigKind> {
        let s = &self.text[start..end];
        if s.len() < 3 || !s.ends_with(')') {
            return Err(self.error(start, "unbalanced '('"));
        }
        let code = s.as_bytes()[1] as char;
        let conv = CallConv::from_code(code)
            .ok_or_else(|| self.error(start + 1, format!("unknown calling convention '{}'", code)))?;

        let mut items = self.split_items(start + 2, end - 1).into_iter();
        let (ra, rb) = items
            .next()
            .ok_or_else(|| self.error(start + 2, "missing return type"))?;
        let ret = self.parse_one(ra, rb)?;
        let params = items
            .map(|(a, b)| self.parse_one(a, b))
            .collect::<InteropResult<Vec<_>>>()?;

        Ok(SigKind::Function(FunctionSig {
            conv,
            ret: Box::new(ret),
            params,
        }))
    }

    /// Byte ranges of the space-separated items in `text[start..end]`.
    fn split_items(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let mut items = Vec::new();
        let mut pos = start;
        while pos < end {
            if self.text.as_bytes()[pos] == b' ' {
                pos += 1;
                continue;
            }
            let len = next_arg_end(&self.text[pos..end]);
            items.push((pos, pos + len));
            pos += len;
        }
        items
    }
}
