//! The instruction set.
//!
//! Instructions are encoded as an opcode byte followed by operand bytes with
//! no alignment. Immediates come in three widths: byte, half (half a word)
//! and full (one word), all signed little-endian. In the opcode mnemonics a
//! trailing `BI`/`HI`/`FI` names the immediate width, and a leading `F`
//! after the operation names the float variant.

use dsc_util::WORD_SIZE;

/// The size of a byte immediate in bytes.
pub const BIMM_SIZE: usize = 1;
/// The size of a half immediate in bytes.
pub const HIMM_SIZE: usize = WORD_SIZE / 2;
/// The size of a full immediate in bytes.
pub const FIMM_SIZE: usize = WORD_SIZE;

/// One opcode of the virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Equivalent to `RETN 0`.
    Ret = 0,
    /// Pop the stack frame, keeping I(1) return values.
    Retn = 1,
    Add = 2,
    AddF = 3,
    AddBI = 4,
    AddHI = 5,
    AddFI = 6,
    And = 7,
    AndBI = 8,
    AndHI = 9,
    AndFI = 10,
    /// Call an address popped from the stack.
    Call = 11,
    /// Call a native function whose index is popped from the stack.
    CallC = 12,
    /// Call a native function by immediate index.
    CallCI = 13,
    /// Call an immediate absolute address.
    CallI = 14,
    /// Call relative by a popped offset.
    CallR = 15,
    CallRB = 16,
    CallRH = 17,
    CallRF = 18,
    Ceq = 19,
    CeqF = 20,
    Cleq = 21,
    CleqF = 22,
    Clt = 23,
    CltF = 24,
    Cmeq = 25,
    CmeqF = 26,
    Cmt = 27,
    CmtF = 28,
    /// Convert the integer at the top of the stack to a float.
    CvtF = 29,
    /// Convert the float at the top of the stack to an integer.
    CvtI = 30,
    Deref = 31,
    DerefI = 32,
    DerefB = 33,
    DerefBI = 34,
    Div = 35,
    DivF = 36,
    DivBI = 37,
    DivHI = 38,
    DivFI = 39,
    Get = 40,
    GetBI = 41,
    GetHI = 42,
    GetFI = 43,
    /// Bitwise complement of the top of the stack.
    Inv = 44,
    J = 45,
    Jcon = 46,
    JconI = 47,
    JI = 48,
    Jr = 49,
    JrBI = 50,
    JrHI = 51,
    JrFI = 52,
    JrCon = 53,
    JrConBI = 54,
    JrConHI = 55,
    JrConFI = 56,
    Mod = 57,
    ModBI = 58,
    ModHI = 59,
    ModFI = 60,
    Mul = 61,
    MulF = 62,
    MulBI = 63,
    MulHI = 64,
    MulFI = 65,
    Not = 66,
    Or = 67,
    OrBI = 68,
    OrHI = 69,
    OrFI = 70,
    Pop = 71,
    PopB = 72,
    PopH = 73,
    PopF = 74,
    PushB = 75,
    PushH = 76,
    PushF = 77,
    PushNB = 78,
    PushNH = 79,
    PushNF = 80,
    SetAdr = 81,
    SetAdrB = 82,
    Sub = 83,
    SubF = 84,
    SubBI = 85,
    SubHI = 86,
    SubFI = 87,
    Syscall = 88,
    Xor = 89,
    XorBI = 90,
    XorHI = 91,
    XorFI = 92,
}

/// The number of opcodes.
pub const NUM_OPCODES: usize = 93;

/// Every opcode in discriminant order, so a byte indexes its opcode.
pub const ALL_OPCODES: [Opcode; NUM_OPCODES] = [
    Opcode::Ret,
    Opcode::Retn,
    Opcode::Add,
    Opcode::AddF,
    Opcode::AddBI,
    Opcode::AddHI,
    Opcode::AddFI,
    Opcode::And,
    Opcode::AndBI,
    Opcode::AndHI,
    Opcode::AndFI,
    Opcode::Call,
    Opcode::CallC,
    Opcode::CallCI,
    Opcode::CallI,
    Opcode::CallR,
    Opcode::CallRB,
    Opcode::CallRH,
    Opcode::CallRF,
    Opcode::Ceq,
    Opcode::CeqF,
    Opcode::Cleq,
    Opcode::CleqF,
    Opcode::Clt,
    Opcode::CltF,
    Opcode::Cmeq,
    Opcode::CmeqF,
    Opcode::Cmt,
    Opcode::CmtF,
    Opcode::CvtF,
    Opcode::CvtI,
    Opcode::Deref,
    Opcode::DerefI,
    Opcode::DerefB,
    Opcode::DerefBI,
    Opcode::Div,
    Opcode::DivF,
    Opcode::DivBI,
    Opcode::DivHI,
    Opcode::DivFI,
    Opcode::Get,
    Opcode::GetBI,
    Opcode::GetHI,
    Opcode::GetFI,
    Opcode::Inv,
    Opcode::J,
    Opcode::Jcon,
    Opcode::JconI,
    Opcode::JI,
    Opcode::Jr,
    Opcode::JrBI,
    Opcode::JrHI,
    Opcode::JrFI,
    Opcode::JrCon,
    Opcode::JrConBI,
    Opcode::JrConHI,
    Opcode::JrConFI,
    Opcode::Mod,
    Opcode::ModBI,
    Opcode::ModHI,
    Opcode::ModFI,
    Opcode::Mul,
    Opcode::MulF,
    Opcode::MulBI,
    Opcode::MulHI,
    Opcode::MulFI,
    Opcode::Not,
    Opcode::Or,
    Opcode::OrBI,
    Opcode::OrHI,
    Opcode::OrFI,
    Opcode::Pop,
    Opcode::PopB,
    Opcode::PopH,
    Opcode::PopF,
    Opcode::PushB,
    Opcode::PushH,
    Opcode::PushF,
    Opcode::PushNB,
    Opcode::PushNH,
    Opcode::PushNF,
    Opcode::SetAdr,
    Opcode::SetAdrB,
    Opcode::Sub,
    Opcode::SubF,
    Opcode::SubBI,
    Opcode::SubHI,
    Opcode::SubFI,
    Opcode::Syscall,
    Opcode::Xor,
    Opcode::XorBI,
    Opcode::XorHI,
    Opcode::XorFI,
];

/// The operand layout of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operands {
    None,
    Byte,
    Half,
    Full,
    /// A full immediate followed by a byte, used by the call opcodes that
    /// carry a target and an argument count.
    FullByte,
}

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        ALL_OPCODES.get(byte as usize).copied()
    }

    /// The operand layout of this opcode.
    pub fn operands(self) -> Operands {
        use Opcode::*;
        match self {
            Ret | Add | AddF | And | Call | CallR | Ceq | CeqF | Cleq | CleqF | Clt | CltF
            | Cmeq | CmeqF | Cmt | CmtF | CvtF | CvtI | Deref | DerefB | Div | DivF | Get
            | Inv | J | Jcon | Jr | JrCon | Mod | Mul | MulF | Not | Or | Pop | SetAdr
            | SetAdrB | Sub | SubF | Xor => Operands::None,

            Retn | AddBI | AndBI | CallC | CallRB | DivBI | GetBI | JrBI | JrConBI | ModBI
            | MulBI | OrBI | PopB | PushB | PushNB | SubBI | Syscall | XorBI => Operands::Byte,

            AddHI | AndHI | CallRH | DivHI | GetHI | JrHI | JrConHI | ModHI | MulHI | OrHI
            | PopH | PushH | PushNH | SubHI | XorHI => Operands::Half,

            AddFI | AndFI | CallRF | DerefI | DerefBI | DivFI | GetFI | JconI | JI | JrFI
            | JrConFI | ModFI | MulFI | OrFI | PopF | PushF | PushNF | SubFI | XorFI => {
                Operands::Full
            }

            CallCI | CallI => Operands::FullByte,
        }
    }

    /// The total size of an instruction with this opcode, in bytes.
    pub fn ins_size(self) -> usize {
        1 + match self.operands() {
            Operands::None => 0,
            Operands::Byte => BIMM_SIZE,
            Operands::Half => HIMM_SIZE,
            Operands::Full => FIMM_SIZE,
            Operands::FullByte => FIMM_SIZE + BIMM_SIZE,
        }
    }

    /// The mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Ret => "RET",
            Retn => "RETN",
            Add => "ADD",
            AddF => "ADDF",
            AddBI => "ADDBI",
            AddHI => "ADDHI",
            AddFI => "ADDFI",
            And => "AND",
            AndBI => "ANDBI",
            AndHI => "ANDHI",
            AndFI => "ANDFI",
            Call => "CALL",
            CallC => "CALLC",
            CallCI => "CALLCI",
            CallI => "CALLI",
            CallR => "CALLR",
            CallRB => "CALLRB",
            CallRH => "CALLRH",
            CallRF => "CALLRF",
            Ceq => "CEQ",
            CeqF => "CEQF",
            Cleq => "CLEQ",
            CleqF => "CLEQF",
            Clt => "CLT",
            CltF => "CLTF",
            Cmeq => "CMEQ",
            CmeqF => "CMEQF",
            Cmt => "CMT",
            CmtF => "CMTF",
            CvtF => "CVTF",
            CvtI => "CVTI",
            Deref => "DEREF",
            DerefI => "DEREFI",
            DerefB => "DEREFB",
            DerefBI => "DEREFBI",
            Div => "DIV",
            DivF => "DIVF",
            DivBI => "DIVBI",
            DivHI => "DIVHI",
            DivFI => "DIVFI",
            Get => "GET",
            GetBI => "GETBI",
            GetHI => "GETHI",
            GetFI => "GETFI",
            Inv => "INV",
            J => "J",
            Jcon => "JCON",
            JconI => "JCONI",
            JI => "JI",
            Jr => "JR",
            JrBI => "JRBI",
            JrHI => "JRHI",
            JrFI => "JRFI",
            JrCon => "JRCON",
            JrConBI => "JRCONBI",
            JrConHI => "JRCONHI",
            JrConFI => "JRCONFI",
            Mod => "MOD",
            ModBI => "MODBI",
            ModHI => "MODHI",
            ModFI => "MODFI",
            Mul => "MUL",
            MulF => "MULF",
            MulBI => "MULBI",
            MulHI => "MULHI",
            MulFI => "MULFI",
            Not => "NOT",
            Or => "OR",
            OrBI => "ORBI",
            OrHI => "ORHI",
            OrFI => "ORFI",
            Pop => "POP",
            PopB => "POPB",
            PopH => "POPH",
            PopF => "POPF",
            PushB => "PUSHB",
            PushH => "PUSHH",
            PushF => "PUSHF",
            PushNB => "PUSHNB",
            PushNH => "PUSHNH",
            PushNF => "PUSHNF",
            SetAdr => "SETADR",
            SetAdrB => "SETADRB",
            Sub => "SUB",
            SubF => "SUBF",
            SubBI => "SUBBI",
            SubHI => "SUBHI",
            SubFI => "SUBFI",
            Syscall => "SYSCALL",
            Xor => "XOR",
            XorBI => "XORBI",
            XorHI => "XORHI",
            XorFI => "XORFI",
        }
    }
}

/// The syscall selectors understood by the `SYSCALL` opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Syscall {
    /// Print a value. arg0 selects the type (0 Integer, 1 Float, 2 String,
    /// 3 Boolean), arg1 selects a trailing newline, arg2 is the value.
    Print = 0,
    /// Compare two strings. arg0 selects the predicate (0 equal, 1 less
    /// than or equal, 2 less than, 3 more than or equal, 4 more than),
    /// arg1 and arg2 are the strings.
    Strcmp = 1,
    /// The length of the string in arg2.
    Strlen = 2,
}

impl Syscall {
    pub fn from_byte(byte: u8) -> Option<Syscall> {
        match byte {
            0 => Some(Syscall::Print),
            1 => Some(Syscall::Strcmp),
            2 => Some(Syscall::Strlen),
            _ => None,
        }
    }
}
