// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    bio::{BLOCK_SIZE, BlockCount},
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use log::{debug, error, info, warn};
