// Copyright 2019 The kvraft Developers. Licensed under Apache-2.0.

mod test_raft;
