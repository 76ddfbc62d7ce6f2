//! Tile IR text parser.
//!
//! The format has layout declarations followed by functions:
//!
//! ```text
//! #blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
//! func @copy(%src: ptr<f32> noalias, %dst: ptr<f32>) {
//! entry:
//!   %r = make_range 0 : i32[128] #blk
//!   %ps = splat %src : ptr<f32>[128] #blk
//!   %p = gep %ps, %r : ptr<f32>[128] #blk
//!   %v = load %p : f32[128] #blk
//!   ...
//!   ret
//! }
//! ```
//!
//! Instructions are parsed in two passes per function: every result gets its
//! value id first, then operands are resolved, so phis may name values defined
//! later in the function.

use super::*;
use crate::analysis::{
    Buffering, Layout, LayoutId, LayoutQuery, LayoutTable, MmaLayout, ScanlineLayout, SharedLayout,
};
use crate::core::{CompileError, CompileResult};
use std::collections::HashMap;

/// A parsed module together with the layout annotations found in the text.
#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub module: Module,
    pub layouts: LayoutTable,
}

pub fn parse_module(text: &str) -> CompileResult<ParsedModule> {
    Parser::new(text).parse()
}

#[derive(Debug, Clone, PartialEq)]
enum Operand<'a> {
    Value(&'a str),
    Block(&'a str),
    Int(i64),
    Float(f64),
    Word(&'a str),
    /// `[%value, ^block]` phi edge.
    Incoming(&'a str, &'a str),
}

#[derive(Debug)]
struct RawInst<'a> {
    line: usize,
    name: Option<&'a str>,
    opcode: &'a str,
    operands: Vec<Operand<'a>>,
    ty: Option<Type>,
    layout: Option<&'a str>,
    align: Option<u32>,
}

#[derive(Debug)]
enum RawBuffering<'a> {
    Double {
        phi: &'a str,
        first: &'a str,
        latch: &'a str,
    },
    Staged {
        stages: u32,
        phi: &'a str,
        latch: &'a str,
        firsts: Vec<&'a str>,
    },
}

#[derive(Debug)]
struct Resolve<'a> {
    layout: LayoutId,
    line: usize,
    buffering: RawBuffering<'a>,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,
    layouts: LayoutTable,

    // Global maps
    layout_names: HashMap<&'a str, LayoutId>,
    /// Value names across the module; `None` once a name is ambiguous.
    global_values: HashMap<&'a str, Option<ValueId>>,
    buffer_resolves: Vec<Resolve<'a>>,

    // Per-function maps
    values: HashMap<&'a str, ValueId>,
    blocks: HashMap<&'a str, BlockId>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::new("module"),
            layouts: LayoutTable::new(),
            layout_names: HashMap::new(),
            global_values: HashMap::new(),
            buffer_resolves: Vec::new(),
            values: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    fn parse(mut self) -> CompileResult<ParsedModule> {
        self.skip_whitespace(true);
        while !self.is_eof() {
            match self.current_char() {
                Some('#') => self.parse_layout_decl()?,
                _ => {
                    let word = self.read_identifier()?;
                    match word {
                        "func" => self.parse_function()?,
                        "module" => {
                            let name = self.read_identifier()?;
                            self.module.name = name.to_string();
                        }
                        other => {
                            return Err(self.error(format!("unexpected '{other}' at top level")))
                        }
                    }
                }
            }
            self.skip_whitespace(true);
        }

        self.resolve_buffers()?;
        for id in self.layouts.layout_ids() {
            self.layouts.layout(id).validate()?;
        }
        Ok(ParsedModule {
            module: self.module,
            layouts: self.layouts,
        })
    }

    // Lexing helpers.

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment up to the end of the line; the newline itself is kept
                // when newlines are significant.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(true);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Like `try_read` but does not cross line ends.
    fn try_read_inline(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> CompileResult<()> {
        if !self.try_read(ch) {
            return Err(self.error(format!(
                "expected '{}' but found {:?}",
                ch,
                self.current_char()
            )));
        }
        Ok(())
    }

    fn read_word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    fn read_identifier(&mut self) -> CompileResult<&'a str> {
        self.skip_whitespace(true);
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => Ok(self.read_word()),
            Some(ch) => Err(self.error(format!("expected identifier but found '{ch}'"))),
            None => Err(self.error("expected identifier but found end of input")),
        }
    }

    /// `%name` or `^name` after the sigil has been checked.
    fn read_sigil_name(&mut self, sigil: char) -> CompileResult<&'a str> {
        self.skip_whitespace(true);
        if self.current_char() != Some(sigil) {
            return Err(self.error(format!(
                "expected '{sigil}' but found {:?}",
                self.current_char()
            )));
        }
        self.advance();
        let name = self.read_word();
        if name.is_empty() {
            return Err(self.error(format!("empty name after '{sigil}'")));
        }
        Ok(name)
    }

    fn read_number_text(&mut self) -> &'a str {
        let start = self.pos;
        if matches!(self.current_char(), Some('-') | Some('+')) {
            self.advance();
        }
        while let Some(ch) = self.current_char() {
            let exponent_sign = matches!(ch, '-' | '+')
                && matches!(self.text[..self.pos].chars().last(), Some('e') | Some('E'));
            if ch.is_ascii_alphanumeric() || ch == '.' || exponent_sign {
                self.advance();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    fn read_int(&mut self) -> CompileResult<i64> {
        self.skip_whitespace(true);
        let text = self.read_number_text();
        text.parse::<i64>()
            .map_err(|_| self.error(format!("expected integer but found '{text}'")))
    }

    fn read_u32(&mut self) -> CompileResult<u32> {
        let value = self.read_int()?;
        u32::try_from(value).map_err(|_| self.error(format!("{value} is out of range")))
    }

    fn read_u32_list(&mut self) -> CompileResult<Vec<u32>> {
        self.expect('[')?;
        let mut items = Vec::new();
        if self.try_read(']') {
            return Ok(items);
        }
        loop {
            items.push(self.read_u32()?);
            if self.try_read(']') {
                return Ok(items);
            }
            self.expect(',')?;
        }
    }

    // Types.

    fn parse_elem(&mut self) -> CompileResult<ElemType> {
        let name = self.read_identifier()?;
        ElemType::from_name(name).ok_or_else(|| self.error(format!("unknown element type '{name}'")))
    }

    fn parse_type(&mut self) -> CompileResult<Type> {
        let name = self.read_identifier()?;
        let scalar = match name {
            "void" => ScalarType::Void,
            "ptr" => {
                self.expect('<')?;
                let elem = self.parse_elem()?;
                let space = if self.try_read(',') { self.read_u32()? } else { 1 };
                self.expect('>')?;
                ScalarType::Ptr(elem, space)
            }
            other => ScalarType::Elem(
                ElemType::from_name(other)
                    .ok_or_else(|| self.error(format!("unknown type '{other}'")))?,
            ),
        };
        self.skip_whitespace(false);
        let shape = if self.current_char() == Some('[') {
            self.read_u32_list()?
        } else {
            Vec::new()
        };
        Ok(Type { scalar, shape })
    }

    // Layouts.

    fn parse_layout_decl(&mut self) -> CompileResult<()> {
        let line = self.line();
        let name = self.read_sigil_name('#')?;
        self.expect('=')?;
        let kind = self.read_identifier()?;
        self.expect('<')?;

        let mut lists: HashMap<&'a str, Vec<u32>> = HashMap::new();
        let mut scalars: HashMap<&'a str, u32> = HashMap::new();
        let mut elem = None;
        let mut buffering = None;
        if !self.try_read('>') {
            loop {
                let key = self.read_identifier()?;
                if key == "double" || key == "stages" {
                    buffering = Some(self.parse_buffering(key)?);
                } else {
                    self.expect('=')?;
                    self.skip_whitespace(true);
                    match self.current_char() {
                        Some('[') => {
                            let list = self.read_u32_list()?;
                            lists.insert(key, list);
                        }
                        Some(ch) if ch.is_alphabetic() => elem = Some(self.parse_elem()?),
                        _ => {
                            let value = self.read_u32()?;
                            scalars.insert(key, value);
                        }
                    }
                }
                if self.try_read('>') {
                    break;
                }
                self.expect(',')?;
            }
        }

        let mut list = |key: &str| -> CompileResult<Vec<u32>> {
            lists
                .remove(key)
                .ok_or_else(|| CompileError::Parse {
                    line,
                    message: format!("layout #{name} is missing '{key}'"),
                })
        };
        let order_of = |order: Vec<u32>| order.into_iter().map(|d| d as usize).collect::<Vec<_>>();
        let pair = |v: Vec<u32>, key: &str| -> CompileResult<[u32; 2]> {
            match v.as_slice() {
                [a, b] => Ok([*a, *b]),
                _ => Err(CompileError::Parse {
                    line,
                    message: format!("mma '{key}' needs two entries"),
                }),
            }
        };

        let layout = match kind {
            "scanline" => Layout::Scanline(ScanlineLayout {
                shape: list("shape")?,
                order: order_of(list("order")?),
                nts: list("nts")?,
                mts: list("mts")?,
            }),
            "mma" => Layout::Mma(MmaLayout {
                shape: pair(list("shape")?, "shape")?,
                wpt: pair(list("wpt")?, "wpt")?,
                fpw: pair(list("fpw").unwrap_or_else(|_| vec![1, 1]), "fpw")?,
                rep: pair(list("rep").unwrap_or_else(|_| vec![1, 1]), "rep")?,
            }),
            "shared" => Layout::Shared(SharedLayout {
                shape: list("shape")?,
                order: order_of(list("order")?),
                elem: elem.ok_or_else(|| CompileError::Parse {
                    line,
                    message: format!("shared layout #{name} needs 'elem'"),
                })?,
                vec: scalars.get("vec").copied().unwrap_or(1),
                per_phase: scalars.get("per_phase").copied().unwrap_or(1),
                max_phase: scalars.get("max_phase").copied().unwrap_or(1),
                buffering: Buffering::None,
            }),
            other => return Err(self.error(format!("unknown layout kind '{other}'"))),
        };

        let id = self.layouts.add_layout(layout);
        if self.layout_names.insert(name, id).is_some() {
            return Err(self.error(format!("layout #{name} declared twice")));
        }
        if let Some(buffering) = buffering {
            self.buffer_resolves.push(Resolve {
                layout: id,
                line,
                buffering,
            });
        }
        Ok(())
    }

    fn parse_buffering(&mut self, kind: &str) -> CompileResult<RawBuffering<'a>> {
        self.expect('(')?;
        let buffering = if kind == "double" {
            let phi = self.read_sigil_name('%')?;
            self.expect(',')?;
            let first = self.read_sigil_name('%')?;
            self.expect(',')?;
            let latch = self.read_sigil_name('%')?;
            RawBuffering::Double { phi, first, latch }
        } else {
            let stages = self.read_u32()?;
            self.expect(',')?;
            let phi = self.read_sigil_name('%')?;
            self.expect(',')?;
            let latch = self.read_sigil_name('%')?;
            self.expect(',')?;
            self.expect('[')?;
            let mut firsts = Vec::new();
            if !self.try_read(']') {
                loop {
                    firsts.push(self.read_sigil_name('%')?);
                    if self.try_read(']') {
                        break;
                    }
                    self.expect(',')?;
                }
            }
            RawBuffering::Staged {
                stages,
                phi,
                latch,
                firsts,
            }
        };
        self.expect(')')?;
        Ok(buffering)
    }

    fn resolve_buffers(&mut self) -> CompileResult<()> {
        let resolves = std::mem::take(&mut self.buffer_resolves);
        for resolve in resolves {
            let lookup = |name: &str| -> CompileResult<ValueId> {
                match self.global_values.get(name) {
                    Some(Some(id)) => Ok(*id),
                    Some(None) => Err(CompileError::Parse {
                        line: resolve.line,
                        message: format!("buffer value %{name} is ambiguous across functions"),
                    }),
                    None => Err(CompileError::Parse {
                        line: resolve.line,
                        message: format!("unknown buffer value %{name}"),
                    }),
                }
            };
            let buffering = match &resolve.buffering {
                RawBuffering::Double { phi, first, latch } => Buffering::Double {
                    phi: lookup(phi)?,
                    first: lookup(first)?,
                    latch: lookup(latch)?,
                },
                RawBuffering::Staged {
                    stages,
                    phi,
                    latch,
                    firsts,
                } => Buffering::Staged {
                    phi: lookup(phi)?,
                    latch: lookup(latch)?,
                    firsts: firsts
                        .iter()
                        .map(|name| lookup(name))
                        .collect::<CompileResult<Vec<_>>>()?,
                    stages: *stages,
                },
            };
            let mut layout = self.layouts.layout(resolve.layout).clone();
            if let Layout::Shared(shared) = &mut layout {
                shared.buffering = buffering;
                self.layouts.set_layout(resolve.layout, layout);
            } else {
                return Err(CompileError::Parse {
                    line: resolve.line,
                    message: "buffering clause on a non-shared layout".to_string(),
                });
            }
        }
        Ok(())
    }

    // Functions.

    fn parse_function(&mut self) -> CompileResult<()> {
        self.values.clear();
        self.blocks.clear();

        let name = self.read_sigil_name('@')?;
        self.expect('(')?;
        let mut args = Vec::new();
        let mut arg_names = Vec::new();
        if !self.try_read(')') {
            loop {
                let arg_name = self.read_sigil_name('%')?;
                self.expect(':')?;
                let ty = self.parse_type()?;
                let attrs = self.parse_attributes()?;
                arg_names.push(arg_name);
                args.push((arg_name.to_string(), ty, attrs));
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        let ret = if self.try_read('-') {
            self.expect('>')?;
            self.parse_type()?
        } else {
            Type::void()
        };
        let func = self.module.add_function(name, args, ret);
        for (i, arg_name) in arg_names.into_iter().enumerate() {
            let id = self.module.function(func).args[i];
            self.define(arg_name, id)?;
        }

        self.expect('{')?;
        let mut raw_blocks: Vec<(BlockId, Vec<RawInst<'a>>)> = Vec::new();
        loop {
            self.skip_whitespace(true);
            if self.try_read('}') {
                break;
            }
            if self.is_eof() {
                return Err(self.error(format!("unterminated function @{name}")));
            }
            let label = self.read_identifier()?;
            self.expect(':')?;
            let block = self.module.add_block(func, label);
            if self.blocks.insert(label, block).is_some() {
                return Err(self.error(format!("block {label} defined twice")));
            }
            let mut insts = Vec::new();
            while !self.at_block_end() {
                insts.push(self.parse_instruction()?);
            }
            raw_blocks.push((block, insts));
        }
        if raw_blocks.is_empty() {
            return Err(self.error(format!("function @{name} has no blocks")));
        }

        // Pass 1: give every result an id.
        let mut pending = Vec::new();
        for (block, insts) in raw_blocks {
            for raw in insts {
                let ty = raw.ty.clone().unwrap_or_else(Type::void);
                let id = if raw.opcode == "const" {
                    let value = match raw.operands.as_slice() {
                        [Operand::Int(v)] => Constant::Int(*v),
                        [Operand::Float(v)] => Constant::Float(*v),
                        [Operand::Word("undef")] => Constant::Undef,
                        [Operand::Word("inf")] => Constant::Float(f64::INFINITY),
                        _ => {
                            return Err(CompileError::Parse {
                                line: raw.line,
                                message: "const needs one literal".to_string(),
                            })
                        }
                    };
                    self.module
                        .add_constant(func, raw.name.unwrap_or(""), ty, value)
                } else {
                    self.module
                        .add_inst(block, raw.name.unwrap_or(""), ty, Inst::Barrier)
                };
                if let Some(name) = raw.name {
                    self.define(name, id)?;
                }
                if let Some(layout) = raw.layout {
                    let Some(&lid) = self.layout_names.get(layout) else {
                        return Err(CompileError::Parse {
                            line: raw.line,
                            message: format!("unknown layout #{layout}"),
                        });
                    };
                    self.layouts.assign(id, lid);
                }
                if let Some(align) = raw.align {
                    self.layouts.set_alignment(id, align);
                }
                if raw.opcode != "const" {
                    pending.push((id, raw));
                }
            }
        }

        // Pass 2: resolve operands.
        for (id, raw) in pending {
            let inst = self.build_inst(&raw)?;
            self.module.set_inst(id, inst);
        }
        Ok(())
    }

    fn define(&mut self, name: &'a str, id: ValueId) -> CompileResult<()> {
        if self.values.insert(name, id).is_some() {
            return Err(self.error(format!("value %{name} defined twice")));
        }
        self.global_values
            .entry(name)
            .and_modify(|slot| *slot = None)
            .or_insert(Some(id));
        Ok(())
    }

    fn parse_attributes(&mut self) -> CompileResult<Vec<Attribute>> {
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace(true);
            match self.current_char() {
                Some(ch) if ch.is_alphabetic() => {}
                _ => return Ok(attrs),
            }
            let word = self.read_word();
            let attr = match word {
                "noalias" => Attribute::NoAlias,
                "readonly" => Attribute::ReadOnly,
                "writeonly" => Attribute::WriteOnly,
                "retune" => Attribute::Retune,
                "align" => {
                    self.expect('(')?;
                    let n = self.read_u32()?;
                    self.expect(')')?;
                    Attribute::Aligned(n)
                }
                other => return Err(self.error(format!("unknown attribute '{other}'"))),
            };
            attrs.push(attr);
        }
    }

    /// Whether the next token starts a label or closes the function.
    fn at_block_end(&mut self) -> bool {
        self.skip_whitespace(true);
        match self.current_char() {
            None | Some('}') => true,
            Some(ch) if ch.is_alphabetic() => {
                let saved = self.pos;
                self.read_word();
                self.skip_whitespace(false);
                let is_label = self.current_char() == Some(':');
                self.pos = saved;
                is_label
            }
            _ => false,
        }
    }

    fn parse_instruction(&mut self) -> CompileResult<RawInst<'a>> {
        self.skip_whitespace(true);
        let line = self.line();
        let name = if self.current_char() == Some('%') {
            let name = self.read_sigil_name('%')?;
            self.expect('=')?;
            Some(name)
        } else {
            None
        };
        let opcode = self.read_identifier()?;

        let mut operands = Vec::new();
        loop {
            self.skip_whitespace(false);
            match self.current_char() {
                Some(',') => self.advance(),
                Some('%') => operands.push(Operand::Value(self.read_sigil_name('%')?)),
                Some('^') => operands.push(Operand::Block(self.read_sigil_name('^')?)),
                Some('[') => {
                    self.advance();
                    let value = self.read_sigil_name('%')?;
                    self.expect(',')?;
                    let block = self.read_sigil_name('^')?;
                    self.expect(']')?;
                    operands.push(Operand::Incoming(value, block));
                }
                Some(ch) if ch.is_ascii_digit() || ch == '-' || ch == '+' => {
                    let text = self.read_number_text();
                    let operand = if let Ok(v) = text.parse::<i64>() {
                        Operand::Int(v)
                    } else if let Ok(v) = text.parse::<f64>() {
                        Operand::Float(v)
                    } else {
                        return Err(self.error(format!("bad numeric literal '{text}'")));
                    };
                    operands.push(operand);
                }
                Some(ch) if ch.is_alphabetic() => operands.push(Operand::Word(self.read_word())),
                _ => break,
            }
        }

        let ty = if self.try_read_inline(':') {
            Some(self.parse_type()?)
        } else {
            None
        };
        let layout = if self.try_read_inline('#') {
            Some(self.read_word())
        } else {
            None
        };
        let align = if self.try_read_inline('!') {
            let key = self.read_word();
            if key != "align" {
                return Err(self.error(format!("unknown annotation !{key}")));
            }
            Some(self.read_u32()?)
        } else {
            None
        };

        self.skip_whitespace(false);
        match self.current_char() {
            None | Some('\n') | Some('}') => {}
            Some(ch) => return Err(self.error(format!("unexpected '{ch}' after instruction"))),
        }
        if name.is_some() && ty.is_none() {
            return Err(self.error(format!("{opcode} result needs a type")));
        }

        Ok(RawInst {
            line,
            name,
            opcode,
            operands,
            ty,
            layout,
            align,
        })
    }

    fn build_inst(&self, raw: &RawInst<'a>) -> CompileResult<Inst> {
        let mut ops = Operands {
            parser: self,
            raw,
            next: 0,
        };
        let inst = match raw.opcode {
            "add" | "sub" | "mul" | "udiv" | "sdiv" | "urem" | "srem" | "shl" | "lshr" | "ashr"
            | "and" | "or" | "xor" | "fadd" | "fsub" | "fmul" | "fdiv" | "frem" => {
                let op = match raw.opcode {
                    "add" => BinaryOp::Add,
                    "sub" => BinaryOp::Sub,
                    "mul" => BinaryOp::Mul,
                    "udiv" => BinaryOp::UDiv,
                    "sdiv" => BinaryOp::SDiv,
                    "urem" => BinaryOp::URem,
                    "srem" => BinaryOp::SRem,
                    "shl" => BinaryOp::Shl,
                    "lshr" => BinaryOp::LShr,
                    "ashr" => BinaryOp::AShr,
                    "and" => BinaryOp::And,
                    "or" => BinaryOp::Or,
                    "xor" => BinaryOp::Xor,
                    "fadd" => BinaryOp::FAdd,
                    "fsub" => BinaryOp::FSub,
                    "fmul" => BinaryOp::FMul,
                    "fdiv" => BinaryOp::FDiv,
                    _ => BinaryOp::FRem,
                };
                Inst::Binary {
                    op,
                    lhs: ops.value()?,
                    rhs: ops.value()?,
                }
            }
            "icmp" => {
                let pred = match ops.word()? {
                    "eq" => IcmpPred::Eq,
                    "ne" => IcmpPred::Ne,
                    "ugt" => IcmpPred::Ugt,
                    "uge" => IcmpPred::Uge,
                    "ult" => IcmpPred::Ult,
                    "ule" => IcmpPred::Ule,
                    "sgt" => IcmpPred::Sgt,
                    "sge" => IcmpPred::Sge,
                    "slt" => IcmpPred::Slt,
                    "sle" => IcmpPred::Sle,
                    other => return Err(ops.error(format!("unknown icmp predicate '{other}'"))),
                };
                Inst::ICmp {
                    pred,
                    lhs: ops.value()?,
                    rhs: ops.value()?,
                }
            }
            "fcmp" => {
                let pred = match ops.word()? {
                    "false" => FcmpPred::False,
                    "oeq" => FcmpPred::Oeq,
                    "ogt" => FcmpPred::Ogt,
                    "oge" => FcmpPred::Oge,
                    "olt" => FcmpPred::Olt,
                    "ole" => FcmpPred::Ole,
                    "one" => FcmpPred::One,
                    "ord" => FcmpPred::Ord,
                    "uno" => FcmpPred::Uno,
                    "ueq" => FcmpPred::Ueq,
                    "ugt" => FcmpPred::Ugt,
                    "uge" => FcmpPred::Uge,
                    "ult" => FcmpPred::Ult,
                    "ule" => FcmpPred::Ule,
                    "une" => FcmpPred::Une,
                    "true" => FcmpPred::True,
                    other => return Err(ops.error(format!("unknown fcmp predicate '{other}'"))),
                };
                Inst::FCmp {
                    pred,
                    lhs: ops.value()?,
                    rhs: ops.value()?,
                }
            }
            "trunc" | "zext" | "sext" | "fptrunc" | "fpext" | "uitofp" | "sitofp" | "fptoui"
            | "fptosi" | "ptrtoint" | "inttoptr" | "bitcast" | "addrspacecast" => {
                let op = match raw.opcode {
                    "trunc" => CastOp::Trunc,
                    "zext" => CastOp::ZExt,
                    "sext" => CastOp::SExt,
                    "fptrunc" => CastOp::FpTrunc,
                    "fpext" => CastOp::FpExt,
                    "uitofp" => CastOp::UiToFp,
                    "sitofp" => CastOp::SiToFp,
                    "fptoui" => CastOp::FpToUi,
                    "fptosi" => CastOp::FpToSi,
                    "ptrtoint" => CastOp::PtrToInt,
                    "inttoptr" => CastOp::IntToPtr,
                    "bitcast" => CastOp::BitCast,
                    _ => CastOp::AddrSpaceCast,
                };
                Inst::Cast {
                    op,
                    arg: ops.value()?,
                }
            }
            "select" => Inst::Select {
                cond: ops.value()?,
                on_true: ops.value()?,
                on_false: ops.value()?,
            },
            "gep" => Inst::Gep {
                ptr: ops.value()?,
                offset: ops.value()?,
            },
            "exp" | "log" | "sin" | "cos" | "sqrt" => {
                let op = match raw.opcode {
                    "exp" => UnaryOp::Exp,
                    "log" => UnaryOp::Log,
                    "sin" => UnaryOp::Sin,
                    "cos" => UnaryOp::Cos,
                    _ => UnaryOp::Sqrt,
                };
                Inst::Unary {
                    op,
                    arg: ops.value()?,
                }
            }
            "umulhi" => Inst::UMulHi {
                lhs: ops.value()?,
                rhs: ops.value()?,
            },
            "make_range" => Inst::MakeRange { start: ops.int()? },
            "splat" => Inst::Splat { arg: ops.value()? },
            "broadcast" => Inst::Broadcast { arg: ops.value()? },
            "reshape" => Inst::Reshape { arg: ops.value()? },
            "cat" => Inst::Cat {
                lhs: ops.value()?,
                rhs: ops.value()?,
            },
            "downcast" => Inst::Downcast { arg: ops.value()? },
            "program_id" => Inst::ProgramId {
                axis: ops.axis()?,
            },
            "num_programs" => Inst::NumPrograms {
                axis: ops.axis()?,
            },
            "load" | "load.ca" | "load.cg" => Inst::Load {
                ptr: ops.value()?,
                mask: ops.opt_value()?,
                other: ops.opt_value()?,
                cache: match raw.opcode {
                    "load.ca" => CacheModifier::Ca,
                    "load.cg" => CacheModifier::Cg,
                    _ => CacheModifier::None,
                },
            },
            "store" => Inst::Store {
                ptr: ops.value()?,
                value: ops.value()?,
                mask: ops.opt_value()?,
            },
            "reduce" => {
                let op = match ops.word()? {
                    "add" => ReduceOp::Add,
                    "sub" => ReduceOp::Sub,
                    "max" => ReduceOp::Max,
                    "min" => ReduceOp::Min,
                    "fadd" => ReduceOp::FAdd,
                    "fsub" => ReduceOp::FSub,
                    "fmax" => ReduceOp::FMax,
                    "fmin" => ReduceOp::FMin,
                    other => return Err(ops.error(format!("unknown reduction '{other}'"))),
                };
                let arg = ops.value()?;
                let axis = u32::try_from(ops.int()?)
                    .map_err(|_| ops.error("negative reduction axis".to_string()))?;
                Inst::Reduce { op, arg, axis }
            }
            "convert_layout" => Inst::ConvertLayout { arg: ops.value()? },
            "load_async" => Inst::LoadAsync {
                ptr: ops.value()?,
                mask: ops.opt_value()?,
                other: ops.opt_value()?,
            },
            "copy_to_shared" => Inst::CopyToShared { arg: ops.value()? },
            "copy_from_shared" => Inst::CopyFromShared { arg: ops.value()? },
            "trans" => Inst::Trans { arg: ops.value()? },
            "async_wait" => Inst::AsyncWait {
                pending: u32::try_from(ops.int()?)
                    .map_err(|_| ops.error("negative async_wait count".to_string()))?,
            },
            "barrier" => Inst::Barrier,
            "alloc_const" => Inst::AllocConst {
                size: u32::try_from(ops.int()?)
                    .map_err(|_| ops.error("negative alloc_const size".to_string()))?,
            },
            "dot" => Inst::Dot {
                a: ops.value()?,
                b: ops.value()?,
                acc: ops.value()?,
            },
            "atomic_cas" => Inst::AtomicCas {
                ptr: ops.value()?,
                cmp: ops.value()?,
                val: ops.value()?,
            },
            "atomic_rmw" => {
                let op = match ops.word()? {
                    "or" => AtomicOp::Or,
                    "and" => AtomicOp::And,
                    "xor" => AtomicOp::Xor,
                    "add" => AtomicOp::Add,
                    "max" => AtomicOp::Max,
                    "min" => AtomicOp::Min,
                    "umax" => AtomicOp::UMax,
                    "umin" => AtomicOp::UMin,
                    "fadd" => AtomicOp::FAdd,
                    "xchg" => AtomicOp::Xchg,
                    other => return Err(ops.error(format!("unknown atomic op '{other}'"))),
                };
                Inst::AtomicRmw {
                    op,
                    ptr: ops.value()?,
                    val: ops.value()?,
                    mask: ops.opt_value()?,
                }
            }
            "phi" => {
                let mut incoming = Vec::new();
                while let Some((value, block)) = ops.opt_incoming()? {
                    incoming.push((value, block));
                }
                Inst::Phi { incoming }
            }
            "br" => Inst::Br { dest: ops.block()? },
            "condbr" => Inst::CondBr {
                cond: ops.value()?,
                on_true: ops.block()?,
                on_false: ops.block()?,
            },
            "ret" => Inst::Ret {
                value: ops.opt_value()?,
            },
            other => return Err(ops.error(format!("unknown opcode '{other}'"))),
        };
        ops.finish()?;
        Ok(inst)
    }
}

/// Sequential reader over the operands of one raw instruction.
struct Operands<'p, 'a> {
    parser: &'p Parser<'a>,
    raw: &'p RawInst<'a>,
    next: usize,
}

impl<'p, 'a> Operands<'p, 'a> {
    fn error(&self, message: String) -> CompileError {
        CompileError::Parse {
            line: self.raw.line,
            message,
        }
    }

    fn peek(&self) -> Option<&Operand<'a>> {
        self.raw.operands.get(self.next)
    }

    fn take(&mut self) -> Option<Operand<'a>> {
        let op = self.raw.operands.get(self.next).cloned();
        if op.is_some() {
            self.next += 1;
        }
        op
    }

    fn lookup(&self, name: &str) -> CompileResult<ValueId> {
        self.parser
            .values
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("undefined value %{name}")))
    }

    fn lookup_block(&self, name: &str) -> CompileResult<BlockId> {
        self.parser
            .blocks
            .get(name)
            .copied()
            .ok_or_else(|| self.error(format!("undefined block ^{name}")))
    }

    fn value(&mut self) -> CompileResult<ValueId> {
        match self.take() {
            Some(Operand::Value(name)) => self.lookup(name),
            other => Err(self.error(format!(
                "{}: expected value operand, found {other:?}",
                self.raw.opcode
            ))),
        }
    }

    fn opt_value(&mut self) -> CompileResult<Option<ValueId>> {
        match self.peek() {
            Some(Operand::Value(_)) => self.value().map(Some),
            _ => Ok(None),
        }
    }

    fn block(&mut self) -> CompileResult<BlockId> {
        match self.take() {
            Some(Operand::Block(name)) => self.lookup_block(name),
            other => Err(self.error(format!(
                "{}: expected block operand, found {other:?}",
                self.raw.opcode
            ))),
        }
    }

    fn opt_incoming(&mut self) -> CompileResult<Option<(ValueId, BlockId)>> {
        match self.peek() {
            Some(Operand::Incoming(..)) => match self.take() {
                Some(Operand::Incoming(value, block)) => {
                    Ok(Some((self.lookup(value)?, self.lookup_block(block)?)))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn int(&mut self) -> CompileResult<i64> {
        match self.take() {
            Some(Operand::Int(v)) => Ok(v),
            other => Err(self.error(format!(
                "{}: expected integer operand, found {other:?}",
                self.raw.opcode
            ))),
        }
    }

    fn axis(&mut self) -> CompileResult<u8> {
        let axis = self.int()?;
        u8::try_from(axis).map_err(|_| self.error(format!("bad grid axis {axis}")))
    }

    fn word(&mut self) -> CompileResult<&'a str> {
        match self.take() {
            Some(Operand::Word(w)) => Ok(w),
            other => Err(self.error(format!(
                "{}: expected keyword operand, found {other:?}",
                self.raw.opcode
            ))),
        }
    }

    fn finish(&self) -> CompileResult<()> {
        if self.next < self.raw.operands.len() {
            return Err(self.error(format!(
                "{}: unexpected extra operand {:?}",
                self.raw.opcode, self.raw.operands[self.next]
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_kernel() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
; copies 128 floats
func @copy(%src: ptr<f32> noalias readonly align(16), %dst: ptr<f32>) {
entry:
  %r = make_range 0 : i32[128] #blk
  %ps = splat %src : ptr<f32>[128] #blk
  %p = gep %ps, %r : ptr<f32>[128] #blk !align 4
  %v = load %p : f32[128] #blk
  %pd = splat %dst : ptr<f32>[128] #blk
  %q = gep %pd, %r : ptr<f32>[128] #blk
  store %q, %v
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let module = &parsed.module;
        let func = module.function_by_name("copy").unwrap();
        let f = module.function(func);
        assert_eq!(f.args.len(), 2);
        assert_eq!(
            f.arg_attrs[0],
            vec![Attribute::NoAlias, Attribute::ReadOnly, Attribute::Aligned(16)]
        );
        let entry = module.block(f.blocks[0]);
        assert_eq!(entry.insts.len(), 8);
        let p = entry.insts[2];
        assert_eq!(parsed.layouts.alignment(p), 4);
        assert!(parsed.layouts.layout_of(p).is_some());
        let load = module.value(entry.insts[3]);
        assert!(matches!(load.inst(), Some(Inst::Load { mask: None, .. })));
        assert_eq!(load.ty.shape, vec![128]);
    }

    #[test]
    fn test_parse_alloc_const() {
        let text = r#"
func @table(%i: i32) -> f32 {
entry:
  %c = alloc_const 64 : ptr<f32, 4>
  %p = gep %c, %i : ptr<f32, 4>
  %v = load %p : f32
  ret %v
}
"#;
        let parsed = parse_module(text).unwrap();
        let module = &parsed.module;
        let arrays = module.const_arrays();
        assert_eq!(arrays.len(), 1);
        let c = module.value(arrays[0]);
        assert!(matches!(c.inst(), Some(Inst::AllocConst { size: 64 })));
        assert_eq!(c.ty.to_string(), "ptr<f32, 4>");
        assert!(module.to_string().contains("alloc_const 64 : ptr<f32, 4>"));

        let err = parse_module(&text.replace("64", "-1")).unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[test]
    fn test_parse_loop_with_phi_forward_reference() {
        let text = r#"
func @count(%n: i32) -> i32 {
entry:
  %zero = const 0 : i32
  %one = const 1 : i32
  br ^loop
loop:
  %i = phi [%zero, ^entry], [%next, ^loop] : i32
  %next = add %i, %one : i32
  %done = icmp sge %next, %n : i1
  condbr %done, ^exit, ^loop
exit:
  ret %next
}
"#;
        let parsed = parse_module(text).unwrap();
        let module = &parsed.module;
        let f = module.function(FuncId(0));
        let loop_block = f.blocks[1];
        let phi = module.value(module.block(loop_block).insts[0]);
        match phi.inst() {
            Some(Inst::Phi { incoming }) => {
                assert_eq!(incoming.len(), 2);
                assert_eq!(incoming[1].1, loop_block);
            }
            other => panic!("expected phi, got {other:?}"),
        }
        assert_eq!(f.constants.len(), 2);
        assert_eq!(module.predecessors(loop_block).len(), 2);
    }

    #[test]
    fn test_parse_shared_layout_with_double_buffer() {
        let text = r#"
#smem = shared<shape=[16, 16], order=[1, 0], elem=f16, vec=8, per_phase=1, max_phase=8, double(%a, %a0, %a1)>
func @k(%x: ptr<f16>) {
entry:
  %a0 = barrier_free_placeholder
}
"#;
        let err = parse_module(text).unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));

        let text = r#"
#blk = scanline<shape=[16, 16], order=[1, 0], nts=[1, 8], mts=[16, 2]>
#smem = shared<shape=[16, 16], order=[1, 0], elem=f16, vec=8, per_phase=1, max_phase=8, double(%a, %a0, %a1)>
func @k(%x: ptr<f16>[16, 16]) {
entry:
  %a0 = load_async %x : f16[16, 16] #smem
  br ^loop
loop:
  %a = phi [%a0, ^entry], [%a1, ^loop] : f16[16, 16] #smem
  %a1 = load_async %x : f16[16, 16] #smem
  br ^loop
}
"#;
        let parsed = parse_module(text).unwrap();
        let shared = parsed
            .layouts
            .layout_ids()
            .into_iter()
            .find_map(|id| parsed.layouts.layout(id).as_shared().cloned())
            .unwrap();
        assert!(matches!(shared.buffering, Buffering::Double { .. }));
        assert_eq!(shared.size_bytes(), 1024);
    }

    #[test]
    fn test_printed_module_parses_back() {
        let text = r#"
func @count(%n: i32, %out: ptr<i32>) {
entry:
  %zero = const 0 : i32
  %one = const 1 : i32
  br ^loop
loop:
  %i = phi [%zero, ^entry], [%next, ^loop] : i32
  %next = add %i, %one : i32
  %done = icmp sge %next, %n : i1
  condbr %done, ^exit, ^loop
exit:
  %old = atomic_rmw add %out, %next : i32
  ret
}
"#;
        let first = parse_module(text).unwrap().module;
        let printed = first.to_string();
        assert!(printed.contains("%i = phi [%zero, ^entry], [%next, ^loop] : i32"));
        assert!(printed.contains("icmp sge, %next, %n"));
        let second = parse_module(&printed).unwrap().module;
        assert_eq!(second.to_string(), printed);
    }

    #[test]
    fn test_parse_errors_report_lines() {
        let err = parse_module("func @f() {\nentry:\n  %x = bogus : i32\n  ret\n}\n").unwrap_err();
        match err {
            CompileError::Parse { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("bogus"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_module("func @f() {\nentry:\n  ret %missing\n}\n").is_err());
    }
}
